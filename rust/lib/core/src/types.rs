use serde::{Deserialize, Serialize};

/// Page-based pagination parameters as sent by clients.
///
/// `per_page == 0` means "everything on one page".
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    /// 1-based page number.
    #[serde(default = "default_page")]
    pub page: usize,

    /// Page size.
    #[serde(default = "default_per_page")]
    pub per_page: usize,
}

fn default_page() -> usize {
    1
}

fn default_per_page() -> usize {
    20
}

impl Default for ListParams {
    fn default() -> Self {
        Self {
            page: default_page(),
            per_page: default_per_page(),
        }
    }
}

impl ListParams {
    /// Row offset of the first item on the requested page.
    pub fn offset(&self) -> usize {
        if self.per_page == 0 {
            return 0;
        }
        self.page.max(1).saturating_sub(1).saturating_mul(self.per_page)
    }

    /// Row limit; `0` means unlimited.
    pub fn limit(&self) -> usize {
        self.per_page
    }
}

/// Result wrapper for list operations.
#[derive(Debug, Clone, Serialize)]
pub struct ListResult<T: Serialize> {
    pub items: Vec<T>,
    pub total: usize,
}

/// Generate a new random UUID (v4, hyphenated).
pub fn new_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}
