use crate::error::{CoordinatorError, Result};

/// Builds pub/sub topic names under a common namespace.
///
/// ```text
/// {namespace}/showings/{showingId}/seats       seat updates (broadcast)
/// {namespace}/bookings/request                 booking requests
/// {namespace}/bookings/response/{viewerId}     booking outcomes
/// {namespace}/bookings/holds                   hold intents
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRouter {
    namespace: String,
}

impl TopicRouter {
    pub fn new(namespace: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        let namespace = namespace.trim_matches('/').to_string();
        check_segment("namespace", &namespace, true)?;
        Ok(Self { namespace })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn seats_topic(&self, showing_id: &str) -> Result<String> {
        check_segment("showing id", showing_id, false)?;
        Ok(format!("{}/showings/{}/seats", self.namespace, showing_id))
    }

    pub fn response_topic(&self, viewer_id: &str) -> Result<String> {
        check_segment("viewer id", viewer_id, false)?;
        Ok(format!("{}/bookings/response/{}", self.namespace, viewer_id))
    }

    pub fn request_topic(&self) -> String {
        format!("{}/bookings/request", self.namespace)
    }

    pub fn holds_topic(&self) -> String {
        format!("{}/bookings/holds", self.namespace)
    }

    /// Inverse of `seats_topic`. `None` for topics outside this namespace.
    pub fn showing_from_topic<'a>(&self, topic: &'a str) -> Option<&'a str> {
        let rest = topic.strip_prefix(self.namespace.as_str())?;
        let rest = rest.strip_prefix("/showings/")?;
        let showing_id = rest.strip_suffix("/seats")?;
        if showing_id.is_empty() || showing_id.contains('/') {
            return None;
        }
        Some(showing_id)
    }
}

fn check_segment(what: &str, value: &str, allow_slash: bool) -> Result<()> {
    if value.trim().is_empty() {
        return Err(CoordinatorError::InvalidArgument(format!("{} must not be empty", what)));
    }
    // wildcard characters of MQTT-style brokers and Redis patterns
    let bad = value
        .chars()
        .any(|c| c == '+' || c == '#' || c == '*' || c.is_whitespace() || (!allow_slash && c == '/'));
    if bad {
        return Err(CoordinatorError::InvalidArgument(format!(
            "{} '{}' contains reserved characters",
            what, value
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_all_topics() {
        let router = TopicRouter::new("cinema").unwrap();
        assert_eq!(router.seats_topic("S1").unwrap(), "cinema/showings/S1/seats");
        assert_eq!(router.response_topic("v42").unwrap(), "cinema/bookings/response/v42");
        assert_eq!(router.request_topic(), "cinema/bookings/request");
        assert_eq!(router.holds_topic(), "cinema/bookings/holds");
    }

    #[test]
    fn same_input_same_topic() {
        let a = TopicRouter::new("cinema").unwrap();
        let b = TopicRouter::new("/cinema/").unwrap();
        assert_eq!(a.seats_topic("S1").unwrap(), b.seats_topic("S1").unwrap());
    }

    #[test]
    fn empty_identifiers_are_invalid() {
        let router = TopicRouter::new("cinema").unwrap();
        assert!(matches!(router.seats_topic(""), Err(CoordinatorError::InvalidArgument(_))));
        assert!(matches!(router.response_topic("  "), Err(CoordinatorError::InvalidArgument(_))));
        assert!(matches!(TopicRouter::new(""), Err(CoordinatorError::InvalidArgument(_))));
    }

    #[test]
    fn wildcards_and_separators_are_invalid() {
        let router = TopicRouter::new("cinema").unwrap();
        assert!(router.seats_topic("S/1").is_err());
        assert!(router.seats_topic("#").is_err());
        assert!(router.response_topic("v+1").is_err());
    }

    #[test]
    fn parses_showing_back_out_of_topic() {
        let router = TopicRouter::new("cinema").unwrap();
        let topic = router.seats_topic("S1").unwrap();
        assert_eq!(router.showing_from_topic(&topic), Some("S1"));
        assert_eq!(router.showing_from_topic("other/showings/S1/seats"), None);
        assert_eq!(router.showing_from_topic("cinema/bookings/request"), None);
    }
}
