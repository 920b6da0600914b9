use serde::{Deserialize, Serialize};

use crate::model::Model;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub login: String,
    pub email: String,
    pub full_name: String,
    pub role_id: Option<String>,
}

impl Model for User {
    const MODEL_NAME: &'static str = "user";

    fn unique_key(&self) -> Option<String> {
        Some(self.login.clone())
    }
}
