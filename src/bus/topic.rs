//! Topic exchange routing: binding patterns against routing keys.

/// AMQP topic match. Words are `.`-separated; `*` matches exactly one
/// word and `#` matches zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&head, tail)) => (word == "*" || word == head) && match_words(rest, tail),
            None => false,
        },
    }
}
