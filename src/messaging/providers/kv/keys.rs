//! Keyspace owned by the KV driver.

pub fn delayed(topic: &str) -> String {
    format!("delayed:{topic}")
}

pub fn queue(name: &str) -> String {
    format!("queue:{name}")
}

pub fn priority(name: &str) -> String {
    format!("priority:{name}")
}

pub fn delayed_jobs(name: &str) -> String {
    format!("delayed_jobs:{name}")
}

/// Registry key for a subscription; the group label only namespaces it
pub fn subscription(topic: &str, group: Option<&str>) -> String {
    match group {
        Some(group) => format!("{group}:{topic}"),
        None => topic.to_string(),
    }
}

/// Sorted-set score that makes ZPOPMIN return the highest priority first
pub fn priority_score(priority: i32) -> f64 {
    -f64::from(priority)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(delayed("orders"), "delayed:orders");
        assert_eq!(queue("emails"), "queue:emails");
        assert_eq!(priority("emails"), "priority:emails");
        assert_eq!(delayed_jobs("emails"), "delayed_jobs:emails");
    }

    #[test]
    fn test_subscription_key_prefixes_group() {
        assert_eq!(subscription("orders", None), "orders");
        assert_eq!(subscription("orders", Some("billing")), "billing:orders");
    }

    #[test]
    fn test_higher_priority_scores_lower() {
        assert!(priority_score(10) < priority_score(1));
        assert!(priority_score(1) < priority_score(0));
    }
}
