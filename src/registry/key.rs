//! Stream identity

/// Stream key combining app name and stream name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    /// Application name (e.g., "live")
    pub app: String,
    /// Stream name (e.g., "cam1")
    pub name: String,
}

impl StreamKey {
    /// Create a new stream key
    pub fn new(app: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            name: name.into(),
        }
    }

    /// Parse an `app/name` path; the stream name may itself contain `/`
    pub fn parse(path: &str) -> Option<Self> {
        let path = path.trim_start_matches('/');
        let (app, name) = path.split_once('/')?;
        if app.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(app, name))
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.app, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(StreamKey::new("live", "cam1").to_string(), "live/cam1");
    }

    #[test]
    fn test_parse() {
        assert_eq!(StreamKey::parse("live/cam1"), Some(StreamKey::new("live", "cam1")));
        assert_eq!(StreamKey::parse("/live/a/b"), Some(StreamKey::new("live", "a/b")));
        assert_eq!(StreamKey::parse("live"), None);
        assert_eq!(StreamKey::parse("live/"), None);
    }
}
