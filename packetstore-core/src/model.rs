/*!
Packet record model shared by every storage backend.

A [`CloudPacket`] is an uploaded bundle carrying region, channel and uploader
metadata plus an ordered list of [`UserPacket`] payloads. Backends store and
return whole record sets; ordering is always ascending by id at both levels.
*/

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// An individual payload nested under a [`CloudPacket`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UserPacket {
    pub id: i32,
    pub name: String,
    pub content: String,
    /// Size hint supplied by the uploader; not checked against `content`
    pub size: i32,
    pub send_timing: String,
}

/// An uploaded content bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CloudPacket {
    pub id: i32,
    pub region: String,
    pub name: String,
    pub channel: String,
    pub uploader: String,
    /// Upload time as supplied by the client, stored verbatim
    pub time: String,
    #[serde(default)]
    pub user_packets: Vec<UserPacket>,
}

impl CloudPacket {
    /// Sort nested user packets ascending by id
    pub fn normalize(&mut self) {
        self.user_packets.sort_by_key(|p| p.id);
    }

    /// Total number of content bytes across all user packets
    pub fn content_len(&self) -> usize {
        self.user_packets.iter().map(|p| p.content.len()).sum()
    }
}

/// Sort a record set into stored order: packets by id, then each packet's user packets by id
pub fn normalize_packets(mut packets: Vec<CloudPacket>) -> Vec<CloudPacket> {
    packets.sort_by_key(|p| p.id);
    for packet in &mut packets {
        packet.normalize();
    }
    packets
}

/// Highest cloud packet id in a record set, if any
pub fn max_id(packets: &[CloudPacket]) -> Option<i32> {
    packets.iter().map(|p| p.id).max()
}

/// Id `create` would assign next: one past the maximum, or 1 when empty
///
/// # Errors
/// `StoreError::Validation` once the maximum id is `i32::MAX`.
pub fn next_id(packets: &[CloudPacket]) -> crate::Result<i32> {
    match max_id(packets) {
        None => Ok(1),
        Some(max) => max.checked_add(1).ok_or_else(id_space_exhausted),
    }
}

pub(crate) fn id_space_exhausted() -> crate::StoreError {
    crate::StoreError::validation(format!("cloud packet id space exhausted at {}", i32::MAX))
}

/// Cloud packet ids present in a record set
pub fn id_set(packets: &[CloudPacket]) -> HashSet<i32> {
    packets.iter().map(|p| p.id).collect()
}

/// Validate that cloud packet ids are unique within a record set
pub fn check_unique_ids(packets: &[CloudPacket]) -> crate::Result<()> {
    let mut ids: Vec<i32> = packets.iter().map(|p| p.id).collect();
    ids.sort_unstable();
    if let Some(pair) = ids.windows(2).find(|w| w[0] == w[1]) {
        return Err(crate::StoreError::validation(format!(
            "duplicate cloud packet id {}",
            pair[0]
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(id: i32, user_ids: &[i32]) -> CloudPacket {
        CloudPacket {
            id,
            region: "cn".to_string(),
            name: format!("n{id}"),
            channel: "wechat".to_string(),
            uploader: "u1".to_string(),
            time: "2024-01-01T00:00:00Z".to_string(),
            user_packets: user_ids
                .iter()
                .map(|&uid| UserPacket {
                    id: uid,
                    name: "a".to_string(),
                    content: "b".to_string(),
                    size: 1,
                    send_timing: "t".to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_json_field_names() {
        let json = serde_json::to_value(packet(1, &[10])).unwrap();
        assert_eq!(json["id"], 1);
        assert_eq!(json["userPackets"][0]["sendTiming"], "t");
        assert!(json.get("user_packets").is_none());
    }

    #[test]
    fn test_missing_user_packets_defaults_to_empty() {
        let json = r#"{"id":3,"region":"r","name":"n","channel":"c","uploader":"u","time":"t"}"#;
        let parsed: CloudPacket = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.id, 3);
        assert!(parsed.user_packets.is_empty());
    }

    #[test]
    fn test_normalize_packets_orders_both_levels() {
        let packets = vec![packet(3, &[9, 2]), packet(1, &[5, 4, 6])];
        let sorted = normalize_packets(packets);

        let ids: Vec<i32> = sorted.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 3]);
        let nested: Vec<i32> = sorted[0].user_packets.iter().map(|p| p.id).collect();
        assert_eq!(nested, vec![4, 5, 6]);
        assert_eq!(sorted[1].user_packets[0].id, 2);
    }

    #[test]
    fn test_max_id_and_uniqueness() {
        let packets = vec![packet(4, &[]), packet(7, &[]), packet(2, &[])];
        assert_eq!(max_id(&packets), Some(7));
        assert_eq!(max_id(&[]), None);
        assert!(check_unique_ids(&packets).is_ok());

        let dupes = vec![packet(4, &[]), packet(4, &[])];
        let err = check_unique_ids(&dupes).unwrap_err();
        assert!(err.to_string().contains("duplicate cloud packet id 4"));
    }

    #[test]
    fn test_next_id_stops_at_i32_max() {
        assert_eq!(next_id(&[]).unwrap(), 1);
        assert_eq!(next_id(&[packet(9, &[]), packet(3, &[])]).unwrap(), 10);

        let err = next_id(&[packet(i32::MAX, &[])]).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Validation);
        assert!(err.to_string().contains("exhausted"));
    }

    #[test]
    fn test_content_len() {
        let mut p = packet(1, &[1, 2]);
        p.user_packets[1].content = "hello".to_string();
        assert_eq!(p.content_len(), 6);
    }
}
