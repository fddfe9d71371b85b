use serde::{Deserialize, Serialize};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The tag listing of a repository, as served by `GET /v2/<name>/tags/list`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TagList {
    /// The repository name.
    pub name: String,

    /// Tags in server order.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// The repository catalog of a registry, as served by `GET /v2/_catalog`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RepoList {
    /// Repository names in server order.
    #[serde(default)]
    pub repositories: Vec<String>,
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
