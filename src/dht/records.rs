//! JSON列表集合记录的合并规则
//!
//! APPEND/REMOVE的值是JSON编码的列表，被当作集合处理：重复元素只保留
//! 一个，保持首次出现的顺序。`null`表示被删除的记录。

use crate::dht::kademlia::DhtError;
use serde_json::Value;

/// 解码集合，值必须是JSON列表
pub fn decode_set(bytes: &[u8]) -> Result<Vec<Value>, DhtError> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Array(items)) => Ok(dedup(items)),
        Ok(other) => Err(DhtError::Encoding(format!("Not a JSON list: {}", other))),
        Err(e) => Err(DhtError::Encoding(e.to_string())),
    }
}

/// 编码集合
pub fn encode_set(items: &[Value]) -> Result<Vec<u8>, DhtError> {
    serde_json::to_vec(items).map_err(|e| DhtError::Encoding(e.to_string()))
}

/// 删除标记
pub fn tombstone() -> Vec<u8> {
    b"null".to_vec()
}

/// 值是否为删除标记
pub fn is_tombstone(bytes: &[u8]) -> bool {
    matches!(serde_json::from_slice::<Value>(bytes), Ok(Value::Null))
}

fn dedup(items: Vec<Value>) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

/// 把delta并入已有值。已有值不存在或不是列表时以delta为准。
pub fn union_into(base: Option<&[u8]>, delta: &[u8]) -> Result<Vec<u8>, DhtError> {
    let delta = decode_set(delta)?;

    let mut merged = base.and_then(|b| decode_set(b).ok()).unwrap_or_default();
    for item in delta {
        if !merged.contains(&item) {
            merged.push(item);
        }
    }

    encode_set(&merged)
}

/// 从已有值中去掉delta。已有值不存在或不是列表时得到空集合。
pub fn subtract_from(base: Option<&[u8]>, delta: &[u8]) -> Result<Vec<u8>, DhtError> {
    let delta = decode_set(delta)?;

    let mut remaining = base.and_then(|b| decode_set(b).ok()).unwrap_or_default();
    remaining.retain(|item| !delta.contains(item));

    encode_set(&remaining)
}

/// 出现次数最多的值，次数相同时取先出现的
pub fn majority(values: &[Vec<u8>]) -> Option<Vec<u8>> {
    let mut counts: Vec<(&Vec<u8>, usize)> = Vec::new();
    for value in values {
        match counts.iter_mut().find(|(v, _)| *v == value) {
            Some((_, n)) => *n += 1,
            None => counts.push((value, 1)),
        }
    }

    let mut best: Option<(&Vec<u8>, usize)> = None;
    for (value, n) in counts {
        if best.map_or(true, |(_, m)| n > m) {
            best = Some((value, n));
        }
    }

    best.map(|(v, _)| v.clone())
}

/// 合并多个副本的值
///
/// 删除标记被忽略；全部是JSON列表时取并集，否则按多数取值。
pub fn merge_replicas(values: &[Vec<u8>]) -> Option<Vec<u8>> {
    let live: Vec<Vec<u8>> = values.iter().filter(|v| !is_tombstone(v)).cloned().collect();
    if live.is_empty() {
        return values.first().cloned();
    }

    let sets: Result<Vec<Vec<Value>>, DhtError> = live.iter().map(|v| decode_set(v)).collect();
    match sets {
        Ok(sets) => {
            let mut merged: Vec<Value> = Vec::new();
            for item in sets.into_iter().flatten() {
                if !merged.contains(&item) {
                    merged.push(item);
                }
            }
            encode_set(&merged).ok()
        }
        Err(_) => majority(&live),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn set(bytes: &[u8]) -> Vec<Value> {
        decode_set(bytes).unwrap()
    }

    #[test]
    fn test_union_is_idempotent() {
        let once = union_into(None, br#"["red","blue"]"#).unwrap();
        let twice = union_into(Some(&once), br#"["red","blue"]"#).unwrap();

        assert_eq!(set(&once), vec![json!("red"), json!("blue")]);
        assert_eq!(set(&twice), set(&once));
    }

    #[test]
    fn test_union_replaces_non_list_base() {
        let merged = union_into(Some(b"\"plain\""), br#"["a"]"#).unwrap();
        assert_eq!(set(&merged), vec![json!("a")]);
    }

    #[test]
    fn test_subtract() {
        let removed = subtract_from(Some(br#"["red","blue"]"#), br#"["red"]"#).unwrap();
        assert_eq!(set(&removed), vec![json!("blue")]);

        // 不存在的键得到空集合
        let empty = subtract_from(None, br#"["red"]"#).unwrap();
        assert!(set(&empty).is_empty());

        // 删除已不存在的元素不改变集合
        let again = subtract_from(Some(&removed), br#"["red"]"#).unwrap();
        assert_eq!(again, removed);
    }

    #[test]
    fn test_invalid_delta_is_rejected() {
        assert!(union_into(None, b"not json").is_err());
        assert!(subtract_from(None, b"{\"a\":1}").is_err());
    }

    #[test]
    fn test_merge_replicas_unions_lists() {
        let merged = merge_replicas(&[
            br#"["red"]"#.to_vec(),
            br#"["blue","red"]"#.to_vec(),
            b"null".to_vec(),
        ])
        .unwrap();

        assert_eq!(set(&merged), vec![json!("red"), json!("blue")]);
    }

    #[test]
    fn test_merge_replicas_falls_back_to_majority() {
        let merged = merge_replicas(&[b"a".to_vec(), b"b".to_vec(), b"b".to_vec()]).unwrap();
        assert_eq!(merged, b"b".to_vec());

        assert_eq!(majority(&[b"x".to_vec(), b"y".to_vec()]), Some(b"x".to_vec()));
        assert_eq!(majority(&[]), None);
    }

    #[test]
    fn test_tombstone() {
        assert!(is_tombstone(&tombstone()));
        assert!(!is_tombstone(b"[]"));
        assert!(!is_tombstone(b"garbage"));
    }
}
