/// Replace everything outside `[A-Za-z0-9_-]` so a device id can be used as a
/// single subject token. Dots, spaces and wildcards would otherwise change
/// the subject hierarchy.
pub fn sanitize_token(raw: &str) -> String {
    let token: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if token.is_empty() {
        "_".to_string()
    } else {
        token
    }
}

/// Subject carrying the events of one partition.
pub fn partition_subject(stream: &str, partition_key: &str) -> String {
    format!("{}.{}", stream, sanitize_token(partition_key))
}

/// Filter matching every partition subject of the stream.
pub fn all_partitions_subject(stream: &str) -> String {
    format!("{}.*", stream)
}

/// Durable consumer name for a single-partition subscription.
pub fn partition_consumer_name(consumer_name: &str, partition_key: &str) -> String {
    format!("{}-{}", consumer_name, sanitize_token(partition_key))
}
