use std::collections::BTreeMap;

use crate::core::request::{ParamMap, ParamValue};

///
/// Parse a query string (or an urlencoded form body) into a `ParamMap`.
///
/// Keys without a value are treated as `"true"`. `key[]` appends to a list and
/// `key[name]` fills a map; a later plain `key=v` replaces either shape.
///
pub fn parse_query(query_string: &str) -> ParamMap {
    let mut query_param_hash = ParamMap::new();

    for query_piece in query_string.split('&').filter(|p| !p.is_empty()) {
        let mut query_iterator = query_piece.splitn(2, '=');
        let raw_key = decode_component(query_iterator.next().unwrap_or(""));
        let value = match query_iterator.next() {
            Some(val) => decode_component(val),
            None => "true".to_owned(),
        };

        match split_brackets(&raw_key) {
            Some((key, "")) => match query_param_hash.get_mut(key) {
                Some(ParamValue::List(list)) => list.push(value),
                _ => {
                    query_param_hash.insert(key.to_owned(), ParamValue::List(vec![value]));
                }
            },
            Some((key, index)) => match query_param_hash.get_mut(key) {
                Some(ParamValue::Map(map)) => {
                    map.insert(index.to_owned(), value);
                }
                _ => {
                    let mut map = BTreeMap::new();
                    map.insert(index.to_owned(), value);
                    query_param_hash.insert(key.to_owned(), ParamValue::Map(map));
                }
            },
            None => {
                query_param_hash.insert(raw_key.clone(), ParamValue::Single(value));
            }
        }
    }

    query_param_hash
}

fn split_brackets(key: &str) -> Option<(&str, &str)> {
    let open = key.find('[')?;
    if !key.ends_with(']') || open == 0 {
        return None;
    }

    Some((&key[..open], &key[open + 1..key.len() - 1]))
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");

    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}
