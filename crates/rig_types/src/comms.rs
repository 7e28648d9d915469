//! Topic naming shared by every endpoint.

/// Suffix appended to a node's source tag to form its data topic.
pub const DATA_SUFFIX: &str = ".data";

/// Suffix of the topic carrying a producer's link-delay estimates.
pub const CONNECTION_SUFFIX: &str = ".connection";

/// Payload marking the end of a data topic.
pub const END_MARKER: &[u8] = b"END";

/// The data topic for a source tag: `"<tag>.data"`.
pub fn data_topic(tag: &str) -> String {
    format!("{}{}", tag, DATA_SUFFIX)
}

/// The connection topic for a source tag: `"<tag>.connection"`.
pub fn connection_topic(tag: &str) -> String {
    format!("{}{}", tag, CONNECTION_SUFFIX)
}

/// The source tag of a data topic, if `topic` is one.
pub fn source_of(topic: &str) -> Option<&str> {
    topic.strip_suffix(DATA_SUFFIX).filter(|tag| !tag.is_empty())
}
