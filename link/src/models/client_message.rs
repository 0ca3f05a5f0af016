use serde::{Deserialize, Serialize};

/// Client-to-server messages on the live feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start receiving values for the listed PVs.
    ///
    /// The server answers with an `initial` frame carrying current values.
    Subscribe {
        #[serde(rename = "pvNames")]
        pv_names: Vec<String>,
    },

    /// Stop receiving values for the listed PVs.
    Unsubscribe {
        #[serde(rename = "pvNames")]
        pv_names: Vec<String>,
    },
}

impl ClientMessage {
    pub fn pv_names(&self) -> &[String] {
        match self {
            ClientMessage::Subscribe { pv_names } | ClientMessage::Unsubscribe { pv_names } => {
                pv_names
            },
        }
    }
}
