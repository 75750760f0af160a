//! Routing of the published messages through exchange bindings.
//!
//! To see the list of exchange types and their semantic, see [AMQP
//! exchanges](https://www.rabbitmq.com/tutorials/amqp-concepts#exchanges).
use metalmq_recovery::{topology::BindingSpec, ExchangeType, FieldTable, FieldValue};

/// Decide if a message with `routing_key` and `headers` goes through the binding of an exchange of
/// `exchange_type`.
///
/// A direct exchange needs the exact routing key, a fanout exchange routes everything, a topic
/// exchange matches the routing key with the binding pattern and a headers exchange matches the
/// message headers with the binding arguments.
pub fn binding_matches(
    exchange_type: ExchangeType,
    binding: &BindingSpec,
    routing_key: &str,
    headers: &FieldTable,
) -> bool {
    match exchange_type {
        ExchangeType::Direct => binding.routing_key == routing_key,
        ExchangeType::Fanout => true,
        ExchangeType::Topic => match_routing_key(&binding.routing_key, routing_key),
        ExchangeType::Headers => match_headers(&binding.arguments, headers),
    }
}

/// Match a topic pattern like 'price.nyse.*' or 'price.#' with a routing key.
///
/// The dot separates the topic path, the '*' matches exactly one segment and the '#' matches zero
/// or more segments.
pub fn match_routing_key(binding_key: &str, message_routing_key: &str) -> bool {
    let bks: Vec<_> = binding_key.split('.').collect();
    let mks: Vec<_> = message_routing_key.split('.').collect();

    match_segments(&bks, &mks)
}

fn match_segments(bks: &[&str], mks: &[&str]) -> bool {
    match bks.split_first() {
        None => mks.is_empty(),
        Some((&"#", rest)) => (0..=mks.len()).any(|skip| match_segments(rest, &mks[skip..])),
        Some((b_key, rest)) => match mks.split_first() {
            Some((m_key, m_rest)) if *b_key == "*" || b_key == m_key => match_segments(rest, m_rest),
            _ => false,
        },
    }
}

/// Match the message headers with the headers of a binding.
///
/// The 'x-match' argument of the binding decides if all or any of the headers need to match. With
/// 'any' or 'all' the headers starting with 'x-' are not taken into account, with 'any-with-x' or
/// 'all-with-x' they are.
pub fn match_headers(binding_args: &FieldTable, message_headers: &FieldTable) -> bool {
    let (x_match_all, with_x) = match binding_args.get("x-match") {
        Some(FieldValue::LongString(s)) if s == "any" => (false, false),
        Some(FieldValue::LongString(s)) if s == "any-with-x" => (false, true),
        Some(FieldValue::LongString(s)) if s == "all-with-x" => (true, true),
        _ => (true, false),
    };

    let binding_headers = binding_args
        .iter()
        .filter(|(k, _)| k.as_str() != "x-match" && (with_x || !k.starts_with("x-")))
        .collect::<Vec<_>>();

    let matches = binding_headers
        .iter()
        .filter(|(k, v)| message_headers.get(k.as_str()) == Some(*v))
        .count();

    if x_match_all {
        matches == binding_headers.len()
    } else {
        matches > 0
    }
}
