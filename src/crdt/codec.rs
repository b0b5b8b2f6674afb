//! Binary update codec.
//!
//! DESIGN
//! ======
//! Updates are protobuf messages (prost derive, no build step). A full state
//! and a delta share one format: a list of entry states. Decoding validates
//! everything before the caller touches a document, so a rejected update
//! never leaves partial state behind.

use prost::Message;

use super::CrdtError;
use super::clock::{MAX_CLOCK, Register, Stamp};
use super::entry::{Entry, Origin, Tombstone};

/// Current wire format version. Anything else is rejected.
pub const UPDATE_VERSION: u32 = 1;

// =============================================================================
// WIRE TYPES
// =============================================================================

#[derive(Clone, PartialEq, Message)]
struct WireUpdate {
    #[prost(uint32, tag = "1")]
    version: u32,
    #[prost(message, repeated, tag = "2")]
    entries: Vec<WireEntry>,
}

#[derive(Clone, PartialEq, Message)]
struct WireStamp {
    #[prost(uint64, tag = "1")]
    clock: u64,
    #[prost(uint64, tag = "2")]
    replica: u64,
}

#[derive(Clone, PartialEq, Message)]
struct WireText {
    #[prost(message, optional, tag = "1")]
    stamp: Option<WireStamp>,
    #[prost(string, tag = "2")]
    value: String,
}

#[derive(Clone, PartialEq, Message)]
struct WireNumber {
    #[prost(message, optional, tag = "1")]
    stamp: Option<WireStamp>,
    #[prost(double, tag = "2")]
    value: f64,
}

#[derive(Clone, PartialEq, Message)]
struct WireOrigin {
    #[prost(message, optional, tag = "1")]
    stamp: Option<WireStamp>,
    #[prost(string, tag = "2")]
    created_by: String,
    #[prost(int64, tag = "3")]
    created_at: i64,
}

#[derive(Clone, PartialEq, Message)]
struct WireTombstone {
    #[prost(message, optional, tag = "1")]
    stamp: Option<WireStamp>,
    #[prost(int64, tag = "2")]
    deleted_at: i64,
}

#[derive(Clone, PartialEq, Message)]
struct WireEntry {
    #[prost(string, tag = "1")]
    id: String,
    #[prost(message, optional, tag = "2")]
    origin: Option<WireOrigin>,
    #[prost(message, optional, tag = "3")]
    content: Option<WireText>,
    #[prost(message, optional, tag = "4")]
    x: Option<WireNumber>,
    #[prost(message, optional, tag = "5")]
    y: Option<WireNumber>,
    #[prost(message, optional, tag = "6")]
    color: Option<WireText>,
    #[prost(message, optional, tag = "7")]
    width: Option<WireNumber>,
    #[prost(message, optional, tag = "8")]
    height: Option<WireNumber>,
    #[prost(message, optional, tag = "9")]
    tombstone: Option<WireTombstone>,
}

// =============================================================================
// ENCODE
// =============================================================================

/// Encode entry states into update bytes.
pub fn encode<'a, I>(entries: I) -> Vec<u8>
where
    I: IntoIterator<Item = (&'a String, &'a Entry)>,
{
    let wire = WireUpdate {
        version: UPDATE_VERSION,
        entries: entries
            .into_iter()
            .map(|(id, entry)| entry_to_wire(id, entry))
            .collect(),
    };
    wire.encode_to_vec()
}

fn stamp_to_wire(stamp: Stamp) -> Option<WireStamp> {
    Some(WireStamp { clock: stamp.clock, replica: stamp.replica })
}

fn text_to_wire(reg: Option<&Register<String>>) -> Option<WireText> {
    reg.map(|r| WireText { stamp: stamp_to_wire(r.stamp), value: r.value.clone() })
}

fn number_to_wire(reg: Option<&Register<f64>>) -> Option<WireNumber> {
    reg.map(|r| WireNumber { stamp: stamp_to_wire(r.stamp), value: r.value })
}

fn entry_to_wire(id: &str, entry: &Entry) -> WireEntry {
    WireEntry {
        id: id.to_owned(),
        origin: entry.origin.as_ref().map(|r| WireOrigin {
            stamp: stamp_to_wire(r.stamp),
            created_by: r.value.created_by.clone(),
            created_at: r.value.created_at,
        }),
        content: text_to_wire(entry.content.as_ref()),
        x: number_to_wire(entry.x.as_ref()),
        y: number_to_wire(entry.y.as_ref()),
        color: text_to_wire(entry.color.as_ref()),
        width: number_to_wire(entry.width.as_ref()),
        height: number_to_wire(entry.height.as_ref()),
        tombstone: entry.tombstone.map(|t| WireTombstone { stamp: stamp_to_wire(t.stamp), deleted_at: t.deleted_at }),
    }
}

// =============================================================================
// DECODE
// =============================================================================

/// Decode and validate update bytes.
///
/// # Errors
///
/// Returns [`CrdtError::CorruptUpdate`] for undecodable bytes, an unknown
/// version, empty ids, missing, zero or out-of-range stamps, and non-finite
/// numbers.
pub fn decode(bytes: &[u8]) -> Result<Vec<(String, Entry)>, CrdtError> {
    let wire = WireUpdate::decode(bytes).map_err(|e| CrdtError::CorruptUpdate(e.to_string()))?;
    if wire.version != UPDATE_VERSION {
        return Err(CrdtError::CorruptUpdate(format!("unsupported version {}", wire.version)));
    }

    wire.entries.into_iter().map(entry_from_wire).collect()
}

fn stamp_from_wire(stamp: Option<WireStamp>, id: &str) -> Result<Stamp, CrdtError> {
    let Some(stamp) = stamp else {
        return Err(CrdtError::CorruptUpdate(format!("missing stamp on {id}")));
    };
    if stamp.clock == 0 {
        return Err(CrdtError::CorruptUpdate(format!("zero clock on {id}")));
    }
    if stamp.clock > MAX_CLOCK {
        return Err(CrdtError::CorruptUpdate(format!("clock out of range on {id}")));
    }
    Ok(Stamp::new(stamp.clock, stamp.replica))
}

fn text_from_wire(text: Option<WireText>, id: &str) -> Result<Option<Register<String>>, CrdtError> {
    text.map(|t| Ok::<_, CrdtError>(Register::new(t.value, stamp_from_wire(t.stamp, id)?)))
        .transpose()
}

fn number_from_wire(number: Option<WireNumber>, id: &str) -> Result<Option<Register<f64>>, CrdtError> {
    number
        .map(|n| {
            if !n.value.is_finite() {
                return Err(CrdtError::CorruptUpdate(format!("non-finite number on {id}")));
            }
            Ok(Register::new(n.value, stamp_from_wire(n.stamp, id)?))
        })
        .transpose()
}

fn entry_from_wire(wire: WireEntry) -> Result<(String, Entry), CrdtError> {
    let id = wire.id;
    if id.is_empty() {
        return Err(CrdtError::CorruptUpdate("empty element id".into()));
    }

    let origin = wire
        .origin
        .map(|o| {
            let stamp = stamp_from_wire(o.stamp, &id)?;
            Ok::<_, CrdtError>(Register::new(Origin { created_by: o.created_by, created_at: o.created_at }, stamp))
        })
        .transpose()?;
    let tombstone = wire
        .tombstone
        .map(|t| Ok::<_, CrdtError>(Tombstone { stamp: stamp_from_wire(t.stamp, &id)?, deleted_at: t.deleted_at }))
        .transpose()?;

    let entry = Entry {
        origin,
        content: text_from_wire(wire.content, &id)?,
        x: number_from_wire(wire.x, &id)?,
        y: number_from_wire(wire.y, &id)?,
        color: text_from_wire(wire.color, &id)?,
        width: number_from_wire(wire.width, &id)?,
        height: number_from_wire(wire.height, &id)?,
        tombstone,
    };
    Ok((id, entry))
}

#[cfg(test)]
#[path = "codec_test.rs"]
mod tests;
