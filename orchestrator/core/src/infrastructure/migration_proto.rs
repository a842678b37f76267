// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Migration wire format.
//!
//! Protocol buffer (proto2) messages exchanged on the "control" channel, one
//! message per binary websocket frame. Field tags match the established
//! migration protocol so mixed-version peers interoperate:
//!
//! ```text
//! message IDMapType       { isuid=1 isgid=2 hostid=3 nsid=4 maprange=5 }
//! message rsyncFeatures   { xattrs=1 delete=2 compress=3 bidirectional=4 }
//! message MigrationHeader { fs=1 criu=2 idmap=3 snapshotNames=4
//!                           rsyncFeatures=5 predump=7 refresh=9 }
//! message MigrationControl{ success=1 message=2 }
//! ```

use crate::domain::channel::ChannelConn;
use crate::domain::idmap::IdmapEntry;
use crate::domain::migration::{
    ControlMessage, CriuType, MigrationError, MigrationFsType, MigrationOffer, RsyncFeatureSet,
};
use bytes::Bytes;
use prost::Message;
use std::time::Duration;

#[derive(Clone, PartialEq, Message)]
pub struct IdMapType {
    #[prost(bool, required, tag = "1")]
    pub isuid: bool,
    #[prost(bool, required, tag = "2")]
    pub isgid: bool,
    #[prost(int32, required, tag = "3")]
    pub hostid: i32,
    #[prost(int32, required, tag = "4")]
    pub nsid: i32,
    #[prost(int32, required, tag = "5")]
    pub maprange: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct RsyncFeatures {
    #[prost(bool, optional, tag = "1")]
    pub xattrs: Option<bool>,
    #[prost(bool, optional, tag = "2")]
    pub delete: Option<bool>,
    #[prost(bool, optional, tag = "3")]
    pub compress: Option<bool>,
    #[prost(bool, optional, tag = "4")]
    pub bidirectional: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct MigrationHeader {
    #[prost(int32, required, tag = "1")]
    pub fs: i32,
    #[prost(int32, optional, tag = "2")]
    pub criu: Option<i32>,
    #[prost(message, repeated, tag = "3")]
    pub idmap: Vec<IdMapType>,
    #[prost(string, repeated, tag = "4")]
    pub snapshot_names: Vec<String>,
    #[prost(message, optional, tag = "5")]
    pub rsync_features: Option<RsyncFeatures>,
    #[prost(bool, optional, tag = "7")]
    pub predump: Option<bool>,
    #[prost(bool, optional, tag = "9")]
    pub refresh: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct MigrationControl {
    #[prost(bool, required, tag = "1")]
    pub success: bool,
    #[prost(string, optional, tag = "2")]
    pub message: Option<String>,
}

fn narrow(value: i64, field: &str) -> Result<i32, MigrationError> {
    i32::try_from(value).map_err(|_| {
        MigrationError::Protocol(format!("idmap {} {} does not fit the wire format", field, value))
    })
}

impl TryFrom<&IdmapEntry> for IdMapType {
    type Error = MigrationError;

    fn try_from(entry: &IdmapEntry) -> Result<Self, Self::Error> {
        Ok(IdMapType {
            isuid: entry.is_uid,
            isgid: entry.is_gid,
            hostid: narrow(entry.host_id, "hostid")?,
            nsid: narrow(entry.ns_id, "nsid")?,
            maprange: narrow(entry.map_range, "maprange")?,
        })
    }
}

impl From<&IdMapType> for IdmapEntry {
    fn from(wire: &IdMapType) -> Self {
        IdmapEntry {
            is_uid: wire.isuid,
            is_gid: wire.isgid,
            host_id: i64::from(wire.hostid),
            ns_id: i64::from(wire.nsid),
            map_range: i64::from(wire.maprange),
        }
    }
}

impl From<&RsyncFeatureSet> for RsyncFeatures {
    fn from(set: &RsyncFeatureSet) -> Self {
        RsyncFeatures {
            xattrs: Some(set.xattrs),
            delete: Some(set.delete),
            compress: Some(set.compress),
            bidirectional: Some(set.bidirectional),
        }
    }
}

impl From<&RsyncFeatures> for RsyncFeatureSet {
    fn from(wire: &RsyncFeatures) -> Self {
        RsyncFeatureSet {
            xattrs: wire.xattrs.unwrap_or(false),
            delete: wire.delete.unwrap_or(false),
            compress: wire.compress.unwrap_or(false),
            bidirectional: wire.bidirectional.unwrap_or(false),
        }
    }
}

pub fn encode_offer(offer: &MigrationOffer) -> Result<Bytes, MigrationError> {
    let header = MigrationHeader {
        fs: offer.fs_type.as_i32(),
        criu: offer.criu.map(|c| c.as_i32()),
        idmap: offer
            .idmap
            .iter()
            .map(IdMapType::try_from)
            .collect::<Result<Vec<_>, _>>()?,
        snapshot_names: offer.snapshot_names.clone(),
        rsync_features: Some(RsyncFeatures::from(&offer.rsync_features)),
        predump: Some(offer.predump),
        refresh: Some(offer.refresh),
    };
    Ok(Bytes::from(header.encode_to_vec()))
}

pub fn decode_offer(frame: &[u8]) -> Result<MigrationOffer, MigrationError> {
    let header = MigrationHeader::decode(frame)
        .map_err(|e| MigrationError::Protocol(format!("bad migration header: {}", e)))?;

    Ok(MigrationOffer {
        fs_type: MigrationFsType::try_from(header.fs)?,
        criu: header.criu.map(CriuType::try_from).transpose()?,
        idmap: header.idmap.iter().map(IdmapEntry::from).collect(),
        snapshot_names: header.snapshot_names,
        rsync_features: header
            .rsync_features
            .as_ref()
            .map(RsyncFeatureSet::from)
            .unwrap_or_default(),
        predump: header.predump.unwrap_or(false),
        refresh: header.refresh.unwrap_or(false),
    })
}

pub fn encode_control(msg: &ControlMessage) -> Bytes {
    let wire = MigrationControl {
        success: msg.success,
        message: (!msg.message.is_empty()).then(|| msg.message.clone()),
    };
    Bytes::from(wire.encode_to_vec())
}

pub fn decode_control(frame: &[u8]) -> Result<ControlMessage, MigrationError> {
    let wire = MigrationControl::decode(frame)
        .map_err(|e| MigrationError::Protocol(format!("bad migration control message: {}", e)))?;
    Ok(ControlMessage {
        success: wire.success,
        message: wire.message.unwrap_or_default(),
    })
}

/// Next frame on `conn` within `idle`. EOF and silence are both errors.
async fn recv_frame(conn: &mut ChannelConn, idle: Duration) -> Result<Bytes, MigrationError> {
    match tokio::time::timeout(idle, conn.recv()).await {
        Err(_) => Err(MigrationError::ControlTimeout),
        Ok(Ok(Some(frame))) => Ok(frame),
        Ok(Ok(None)) => Err(MigrationError::ControlClosed),
        Ok(Err(e)) => Err(e.into()),
    }
}

pub async fn send_offer(conn: &mut ChannelConn, offer: &MigrationOffer) -> Result<(), MigrationError> {
    conn.send(encode_offer(offer)?).await?;
    Ok(())
}

pub async fn recv_offer(conn: &mut ChannelConn, idle: Duration) -> Result<MigrationOffer, MigrationError> {
    let frame = recv_frame(conn, idle).await?;
    decode_offer(&frame)
}

pub async fn send_control(conn: &mut ChannelConn, msg: &ControlMessage) -> Result<(), MigrationError> {
    conn.send(encode_control(msg)).await?;
    Ok(())
}

pub async fn recv_control(conn: &mut ChannelConn, idle: Duration) -> Result<ControlMessage, MigrationError> {
    let frame = recv_frame(conn, idle).await?;
    decode_control(&frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_carries_idmap_and_features() {
        let offer = MigrationOffer {
            fs_type: MigrationFsType::Zfs,
            criu: Some(CriuType::CriuRsync),
            idmap: vec![IdmapEntry::uid(1_000_000, 0, 65_536)],
            snapshot_names: vec!["snap0".to_string()],
            rsync_features: RsyncFeatureSet {
                xattrs: true,
                delete: false,
                compress: true,
                bidirectional: false,
            },
            predump: false,
            refresh: true,
        };
        let decoded = decode_offer(&encode_offer(&offer).unwrap()).unwrap();
        assert_eq!(decoded, offer);
    }

    #[test]
    fn test_absent_fields_mean_not_offered() {
        let bare = MigrationHeader {
            fs: 0,
            criu: None,
            idmap: vec![],
            snapshot_names: vec![],
            rsync_features: None,
            predump: None,
            refresh: None,
        };
        let offer = decode_offer(&bare.encode_to_vec()).unwrap();
        assert_eq!(offer.fs_type, MigrationFsType::Rsync);
        assert_eq!(offer.criu, None);
        assert_eq!(offer.rsync_features, RsyncFeatureSet::default());
        assert!(!offer.is_live());
    }

    #[test]
    fn test_field_tags_on_the_wire() {
        let control = encode_control(&ControlMessage::failure("disk full"));
        // tag 1 varint, then tag 2 length-delimited
        assert_eq!(control[0], 0x08);
        assert_eq!(control[1], 0x00);
        assert_eq!(control[2], 0x12);

        let header = MigrationHeader {
            fs: 1,
            criu: None,
            idmap: vec![],
            snapshot_names: vec![],
            rsync_features: None,
            predump: Some(true),
            refresh: None,
        }
        .encode_to_vec();
        assert_eq!(header, vec![0x08, 0x01, 0x38, 0x01]);
    }

    #[test]
    fn test_rejects_unknown_transport() {
        let header = MigrationHeader {
            fs: 42,
            criu: None,
            idmap: vec![],
            snapshot_names: vec![],
            rsync_features: None,
            predump: None,
            refresh: None,
        };
        assert!(matches!(
            decode_offer(&header.encode_to_vec()),
            Err(MigrationError::UnsupportedTransport(_))
        ));
    }

    #[tokio::test]
    async fn test_recv_control_eof_is_not_success() {
        let (mut a, mut b) = ChannelConn::pair("control", 1);
        a.close().await.unwrap();
        assert!(matches!(
            recv_control(&mut b, Duration::from_secs(1)).await,
            Err(MigrationError::ControlClosed)
        ));
    }

    #[tokio::test]
    async fn test_recv_control_silence_times_out() {
        let (_a, mut b) = ChannelConn::pair("control", 1);
        assert!(matches!(
            recv_control(&mut b, Duration::from_millis(20)).await,
            Err(MigrationError::ControlTimeout)
        ));
    }
}
