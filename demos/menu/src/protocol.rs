//! Menu payloads carried inside envelopes.

use serde::{Deserialize, Serialize};

/// One dish on the menu.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dish {
    pub name: String,
    pub description: String,
    /// Price in pence.
    pub price: u32,
}
