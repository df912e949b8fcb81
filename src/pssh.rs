//! PSSH box parsing for `encrypted` event init data.
//!
//! `cenc` init data is a concatenation of one or more PSSH boxes, one per
//! DRM system the content was packaged for.
use std::io::{Cursor, Read};
use std::str::FromStr;

use base64::Engine;
use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Known DRM system IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemId {
    Widevine,
    PlayReady,
    ClearKey,
}

impl SystemId {
    pub fn to_uuid(self) -> Uuid {
        match self {
            SystemId::Widevine => Uuid::from_u128(0xedef8ba979d64acea3c827dcd51d21ed),
            SystemId::PlayReady => Uuid::from_u128(0x9a04f07998404286ab92e65be0885f95),
            SystemId::ClearKey => Uuid::from_u128(0x1077efecc0b24d02ace33c1e52e2fb4b),
        }
    }

    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        [SystemId::Widevine, SystemId::PlayReady, SystemId::ClearKey]
            .into_iter()
            .find(|s| s.to_uuid() == uuid)
    }
}

/// One parsed PSSH box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pssh {
    pub version: u8,
    pub flags: u32,
    pub system_id: Uuid,
    pub key_ids: Vec<Uuid>,
    pub init_data: Vec<u8>,
}

impl Pssh {
    /// Create a new PSSH box.
    ///
    /// Version 0 boxes cannot carry key ids.
    pub fn new(
        system_id: Uuid,
        key_ids: Vec<Uuid>,
        init_data: Vec<u8>,
        version: u8,
        flags: u32,
    ) -> Result<Self> {
        if version != 0 && version != 1 {
            return Err(Error::InvalidInitData(format!(
                "Invalid version: {}",
                version
            )));
        }

        if version == 0 && !key_ids.is_empty() {
            return Err(Error::InvalidInitData(
                "Version 0 PSSH boxes must use only init_data".to_string(),
            ));
        }

        Ok(Self {
            version,
            flags,
            system_id,
            key_ids,
            init_data,
        })
    }

    /// Parse exactly one PSSH box.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let (pssh, consumed) = parse_pssh_box(data)?;
        if consumed != data.len() {
            return Err(Error::InvalidInitData(format!(
                "{} trailing bytes after PSSH box",
                data.len() - consumed
            )));
        }
        Ok(pssh)
    }

    /// Parse one PSSH box from base64.
    pub fn from_base64(data_b64: &str) -> Result<Self> {
        let data = base64::engine::general_purpose::STANDARD.decode(data_b64.trim())?;
        Self::from_bytes(&data)
    }

    /// Known DRM system of this box, if any.
    pub fn system(&self) -> Option<SystemId> {
        SystemId::from_uuid(self.system_id)
    }

    /// Serialize as a full PSSH box.
    pub fn to_bytes(&self) -> Vec<u8> {
        build_pssh_box(self)
    }

    /// Serialize as a base64 PSSH box.
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.to_bytes())
    }
}

impl FromStr for Pssh {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Pssh::from_base64(s)
    }
}

/// Split concatenated `cenc` init data into its PSSH boxes.
pub fn split_pssh_boxes(data: &[u8]) -> Result<Vec<Pssh>> {
    if data.is_empty() {
        return Err(Error::InvalidInitData("Data must not be empty".to_string()));
    }

    let mut boxes = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let (pssh, consumed) = parse_pssh_box(&data[offset..])?;
        boxes.push(pssh);
        offset += consumed;
    }
    Ok(boxes)
}

/// Count the PSSH boxes ("atoms") in `cenc` init data.
///
/// Unlike [`split_pssh_boxes`] this only walks box headers, so a box with an
/// unparsable body still counts. Walking stops at the first header that does
/// not fit in the remaining data.
pub fn count_pssh_atoms(data: &[u8]) -> usize {
    let mut count = 0;
    let mut rest = data;
    while let Ok(header) = BoxHeader::read(rest) {
        if &header.box_type == b"pssh" {
            count += 1;
        }
        rest = &rest[header.size..];
    }
    count
}

/// ISO BMFF box header at the start of a buffer.
struct BoxHeader {
    box_type: [u8; 4],
    /// Size, type and optional largesize fields.
    header_len: usize,
    /// Whole box, header included.
    size: usize,
}

impl BoxHeader {
    fn read(data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(Error::InvalidInitData("Data too short".to_string()));
        }
        let mut box_type = [0u8; 4];
        box_type.copy_from_slice(&data[4..8]);

        // 0 runs to the end of the data, 1 means a 64-bit largesize follows.
        let (size, header_len) = match BigEndian::read_u32(&data[..4]) {
            0 => (data.len(), 8),
            1 => {
                if data.len() < 16 {
                    return Err(Error::InvalidInitData("Missing largesize".to_string()));
                }
                let large = BigEndian::read_u64(&data[8..16]);
                (usize::try_from(large).unwrap_or(usize::MAX), 16)
            }
            n => (n as usize, 8),
        };

        if size < header_len {
            return Err(Error::InvalidInitData(format!(
                "Box size {} is smaller than its header",
                size
            )));
        }
        if size > data.len() {
            return Err(Error::InvalidInitData(format!(
                "Box size {} exceeds {} bytes of data",
                size,
                data.len()
            )));
        }

        Ok(Self {
            box_type,
            header_len,
            size,
        })
    }
}

fn truncated(field: &str) -> Error {
    Error::InvalidInitData(format!("PSSH box truncated before {}", field))
}

/// Parse the box at the start of `data`, returning it and its byte length.
fn parse_pssh_box(data: &[u8]) -> Result<(Pssh, usize)> {
    let header = BoxHeader::read(data)?;
    if &header.box_type != b"pssh" {
        return Err(Error::InvalidInitData("Not a PSSH box".to_string()));
    }

    let body = &data[header.header_len..header.size];
    let mut reader = Cursor::new(body);

    let version = reader.read_u8().map_err(|_| truncated("version"))?;
    let flags = reader
        .read_u24::<BigEndian>()
        .map_err(|_| truncated("flags"))?;
    let mut system_id = [0u8; 16];
    reader
        .read_exact(&mut system_id)
        .map_err(|_| truncated("system id"))?;

    let mut key_ids = Vec::new();
    if version == 1 {
        let kid_count = reader
            .read_u32::<BigEndian>()
            .map_err(|_| truncated("key id count"))?;
        for _ in 0..kid_count {
            let mut kid = [0u8; 16];
            reader.read_exact(&mut kid).map_err(|_| truncated("key ids"))?;
            key_ids.push(Uuid::from_bytes(kid));
        }
    }

    let data_size = reader
        .read_u32::<BigEndian>()
        .map_err(|_| truncated("init data length"))? as usize;
    let data_start = reader.position() as usize;
    let init_data = body
        .get(data_start..data_start + data_size)
        .ok_or_else(|| truncated("end of init data"))?
        .to_vec();

    Ok((
        Pssh {
            version,
            flags,
            system_id: Uuid::from_bytes(system_id),
            key_ids,
            init_data,
        },
        header.size,
    ))
}

fn build_pssh_box(pssh: &Pssh) -> Vec<u8> {
    let kid_len = if pssh.version == 1 {
        4 + 16 * pssh.key_ids.len()
    } else {
        0
    };
    let size = 8 + 4 + 16 + kid_len + 4 + pssh.init_data.len();

    let mut out = Vec::with_capacity(size);
    out.extend_from_slice(&(size as u32).to_be_bytes());
    out.extend_from_slice(b"pssh");
    out.push(pssh.version);
    out.extend_from_slice(&pssh.flags.to_be_bytes()[1..]);
    out.extend_from_slice(pssh.system_id.as_bytes());
    if pssh.version == 1 {
        out.extend_from_slice(&(pssh.key_ids.len() as u32).to_be_bytes());
        for kid in pssh.key_ids.iter() {
            out.extend_from_slice(kid.as_bytes());
        }
    }
    out.extend_from_slice(&(pssh.init_data.len() as u32).to_be_bytes());
    out.extend_from_slice(&pssh.init_data);
    out
}

#[cfg(test)]
mod tests {
    use super::{count_pssh_atoms, split_pssh_boxes, Pssh, SystemId};
    use uuid::Uuid;

    fn widevine_box() -> Pssh {
        Pssh::new(SystemId::Widevine.to_uuid(), Vec::new(), b"wv-data".to_vec(), 0, 0)
            .expect("create pssh")
    }

    #[test]
    fn pssh_bytes_parse_back() {
        let pssh = widevine_box();
        let parsed = Pssh::from_bytes(&pssh.to_bytes()).expect("parse pssh");

        assert_eq!(parsed.version, 0);
        assert_eq!(parsed.system(), Some(SystemId::Widevine));
        assert_eq!(parsed.init_data, b"wv-data");
    }

    #[test]
    fn v1_box_keeps_key_ids() {
        let kid = Uuid::new_v4();
        let pssh = Pssh::new(SystemId::ClearKey.to_uuid(), vec![kid], Vec::new(), 1, 0)
            .expect("create pssh");

        let parsed: Pssh = pssh.to_base64().parse().expect("parse base64");
        assert_eq!(parsed.key_ids, vec![kid]);
    }

    #[test]
    fn v0_box_rejects_key_ids() {
        let err = Pssh::new(SystemId::Widevine.to_uuid(), vec![Uuid::nil()], Vec::new(), 0, 0)
            .expect_err("v0 with kids");
        assert!(err.to_string().contains("Version 0"));
    }

    #[test]
    fn concatenated_boxes_split_and_count() {
        let playready = Pssh::new(
            SystemId::PlayReady.to_uuid(),
            Vec::new(),
            vec![0u8; 40],
            0,
            0,
        )
        .expect("create pssh");
        let clearkey = Pssh::new(SystemId::ClearKey.to_uuid(), vec![Uuid::new_v4()], Vec::new(), 1, 0)
            .expect("create pssh");

        let mut data = widevine_box().to_bytes();
        data.extend_from_slice(&playready.to_bytes());
        data.extend_from_slice(&clearkey.to_bytes());

        assert_eq!(count_pssh_atoms(&data), 3);
        let boxes = split_pssh_boxes(&data).expect("split");
        let systems: Vec<_> = boxes.iter().map(Pssh::system).collect();
        assert_eq!(
            systems,
            vec![
                Some(SystemId::Widevine),
                Some(SystemId::PlayReady),
                Some(SystemId::ClearKey)
            ]
        );
    }

    #[test]
    fn truncated_data_counts_complete_boxes_only() {
        let mut data = widevine_box().to_bytes();
        let second = widevine_box().to_bytes();
        data.extend_from_slice(&second[..10]);

        assert_eq!(count_pssh_atoms(&data), 1);
        assert!(split_pssh_boxes(&data).is_err());
        assert!(split_pssh_boxes(&[]).is_err());
    }

    #[test]
    fn size_zero_box_runs_to_end_of_data() {
        let mut data = widevine_box().to_bytes();
        data[..4].copy_from_slice(&0u32.to_be_bytes());

        assert_eq!(count_pssh_atoms(&data), 1);
        let boxes = split_pssh_boxes(&data).expect("split");
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].init_data, b"wv-data");
    }

    #[test]
    fn largesize_box_is_counted_and_parsed() {
        let compact = widevine_box().to_bytes();
        let mut data = Vec::new();
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(b"pssh");
        data.extend_from_slice(&(compact.len() as u64 + 8).to_be_bytes());
        data.extend_from_slice(&compact[8..]);
        data.extend_from_slice(&compact);

        assert_eq!(count_pssh_atoms(&data), 2);
        let boxes = split_pssh_boxes(&data).expect("split");
        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[0], boxes[1]);
    }

    #[test]
    fn undersized_box_header_stops_counting() {
        let mut data = widevine_box().to_bytes();
        data[..4].copy_from_slice(&4u32.to_be_bytes());

        assert_eq!(count_pssh_atoms(&data), 0);
        assert!(split_pssh_boxes(&data).is_err());
    }
}
