use crate::dht::kademlia::{NodeId, ID_LENGTH};
use std::convert::TryFrom;

/// 验证节点ID的格式和有效性
///
/// # 参数
/// * `node_id_str` - 要验证的节点ID字符串，大小写均可
///
/// # 返回值
/// * `Ok(NodeId)` - 如果验证成功，返回解析后的NodeId
/// * `Err(String)` - 如果验证失败，返回错误信息
pub fn validate_node_id(node_id_str: &str) -> Result<NodeId, String> {
    // 20字节的十六进制表示
    if node_id_str.len() != ID_LENGTH * 2 || !node_id_str.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("Invalid node ID format: {}", node_id_str));
    }

    let bytes = match hex::decode(node_id_str) {
        Ok(b) => b,
        Err(e) => return Err(format!("Invalid NodeId hex: {}", e)),
    };

    NodeId::try_from(bytes.as_slice()).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_node_id() {
        let id = NodeId::random();
        assert_eq!(validate_node_id(&id.to_hex_upper()).unwrap(), id);
        assert_eq!(validate_node_id(&id.to_string()).unwrap(), id);

        assert!(validate_node_id("abc").is_err());
        assert!(validate_node_id(&"zz".repeat(ID_LENGTH)).is_err());
    }
}
