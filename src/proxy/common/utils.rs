// Utility functions

/// Wall-clock epoch milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn generate_request_id() -> String {
    format!("req-{}", uuid::Uuid::new_v4().simple())
}

/// Short random id for log correlation
pub fn generate_random_id() -> String {
    use rand::Rng;
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_unique() {
        let a = generate_request_id();
        let b = generate_request_id();
        assert!(a.starts_with("req-"));
        assert_ne!(a, b);
        assert_eq!(generate_random_id().len(), 8);
    }
}
