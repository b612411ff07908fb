use std::fmt;
use std::sync::Arc;

/// Identifies one media item of one study.
///
/// Stable for the lifetime of the media it refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    study_id: Arc<str>,
    media_id: Arc<str>,
}

impl CacheKey {
    pub fn new(study_id: impl Into<Arc<str>>, media_id: impl Into<Arc<str>>) -> Self {
        Self {
            study_id: study_id.into(),
            media_id: media_id.into(),
        }
    }

    pub fn study_id(&self) -> &str {
        &self.study_id
    }

    pub fn media_id(&self) -> &str {
        &self.media_id
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.study_id, self.media_id)
    }
}
