//! Timeline action messages (endpoint 0x2CB0).
//!
//! The watch invokes an action on a timeline item or notification; the
//! phone answers with a response carrying display attributes.

use bytes::Bytes;
use uuid::Uuid;

use crate::codec::{Endian, LengthPrefix, Mappable, StructReader, StructWriter};
use crate::error::{PebblewireError, Result};

const CMD_INVOKE_ACTION: u8 = 0x02;
const CMD_ACTION_RESPONSE: u8 = 0x11;

/// Attribute id for the response subtitle text.
pub const ATTR_SUBTITLE: u8 = 0x02;
/// Attribute id for the response icon resource (u32 LE).
pub const ATTR_LARGE_ICON: u8 = 0x06;

/// Phone's verdict on an invoked action.
///
/// Values compare by wire code, so `Other(0)` equals `Ack`.
#[derive(Debug, Clone, Copy)]
pub enum ActionResponseCode {
    Ack,
    Nack,
    /// Any code other than 0 and 1.
    Other(u8),
}

impl PartialEq for ActionResponseCode {
    fn eq(&self, other: &Self) -> bool {
        self.code() == other.code()
    }
}

impl Eq for ActionResponseCode {}

impl ActionResponseCode {
    pub fn code(self) -> u8 {
        match self {
            ActionResponseCode::Ack => 0x00,
            ActionResponseCode::Nack => 0x01,
            ActionResponseCode::Other(c) => c,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => ActionResponseCode::Ack,
            0x01 => ActionResponseCode::Nack,
            other => ActionResponseCode::Other(other),
        }
    }
}

/// One id/content pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineAttribute {
    pub id: u8,
    pub content: Bytes,
}

impl TimelineAttribute {
    pub fn new(id: u8, content: impl Into<Bytes>) -> Self {
        Self {
            id,
            content: content.into(),
        }
    }

    /// Subtitle shown on the watch after the action completes.
    pub fn subtitle(text: &str) -> Self {
        Self::new(ATTR_SUBTITLE, Bytes::copy_from_slice(text.as_bytes()))
    }

    /// Icon resource shown on the watch after the action completes.
    pub fn large_icon(resource: u32) -> Self {
        Self::new(
            ATTR_LARGE_ICON,
            Bytes::copy_from_slice(&resource.to_le_bytes()),
        )
    }
}

impl Mappable for TimelineAttribute {
    fn write_to(&self, w: &mut StructWriter) -> Result<()> {
        w.u8(self.id);
        w.sized_bytes(LengthPrefix::U16(Endian::Little), &self.content)
    }

    fn read_from(r: &mut StructReader<'_>) -> Result<Self> {
        let id = r.u8()?;
        let content = Bytes::copy_from_slice(r.sized_bytes(LengthPrefix::U16(Endian::Little))?);
        Ok(Self { id, content })
    }
}

fn write_attributes(w: &mut StructWriter, attributes: &[TimelineAttribute]) -> Result<()> {
    let count = u8::try_from(attributes.len()).map_err(|_| {
        PebblewireError::Malformed(format!("{} attributes exceed u8 count", attributes.len()))
    })?;
    w.u8(count);
    for attr in attributes {
        attr.write_to(w)?;
    }
    Ok(())
}

fn read_attributes(r: &mut StructReader<'_>) -> Result<Vec<TimelineAttribute>> {
    let count = r.u8()? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(TimelineAttribute::read_from(r)?);
    }
    Ok(out)
}

/// Timeline action traffic in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineActionMessage {
    /// Watch → phone: the user picked an action.
    InvokeAction {
        item_id: Uuid,
        action_id: u8,
        attributes: Vec<TimelineAttribute>,
    },
    /// Phone → watch: outcome of an invoked action.
    ActionResponse {
        item_id: Uuid,
        response: ActionResponseCode,
        attributes: Vec<TimelineAttribute>,
    },
}

impl TimelineActionMessage {
    pub fn is_known_command(command: u8) -> bool {
        matches!(command, CMD_INVOKE_ACTION | CMD_ACTION_RESPONSE)
    }
}

impl Mappable for TimelineActionMessage {
    fn write_to(&self, w: &mut StructWriter) -> Result<()> {
        match self {
            TimelineActionMessage::InvokeAction {
                item_id,
                action_id,
                attributes,
            } => {
                w.u8(CMD_INVOKE_ACTION);
                w.uuid(item_id);
                w.u8(*action_id);
                write_attributes(w, attributes)
            }
            TimelineActionMessage::ActionResponse {
                item_id,
                response,
                attributes,
            } => {
                w.u8(CMD_ACTION_RESPONSE);
                w.uuid(item_id);
                w.u8(response.code());
                write_attributes(w, attributes)
            }
        }
    }

    fn read_from(r: &mut StructReader<'_>) -> Result<Self> {
        match r.u8()? {
            CMD_INVOKE_ACTION => Ok(TimelineActionMessage::InvokeAction {
                item_id: r.uuid()?,
                action_id: r.u8()?,
                attributes: read_attributes(r)?,
            }),
            CMD_ACTION_RESPONSE => Ok(TimelineActionMessage::ActionResponse {
                item_id: r.uuid()?,
                response: ActionResponseCode::from_code(r.u8()?),
                attributes: read_attributes(r)?,
            }),
            other => Err(PebblewireError::Malformed(format!(
                "unknown timeline command {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoke_action_parse() {
        let item = Uuid::from_u128(0x11);
        let mut raw = vec![CMD_INVOKE_ACTION];
        raw.extend_from_slice(item.as_bytes());
        raw.push(3); // action id
        raw.push(1); // one attribute
        raw.extend_from_slice(&[0x01, 2, 0, b'o', b'k']);

        let msg = TimelineActionMessage::deserialize(&raw).unwrap();
        assert_eq!(
            msg,
            TimelineActionMessage::InvokeAction {
                item_id: item,
                action_id: 3,
                attributes: vec![TimelineAttribute::new(0x01, Bytes::from_static(b"ok"))],
            }
        );
    }

    #[test]
    fn test_action_response_layout() {
        let msg = TimelineActionMessage::ActionResponse {
            item_id: Uuid::nil(),
            response: ActionResponseCode::Ack,
            attributes: vec![TimelineAttribute::large_icon(0x0102_0304)],
        };
        let bytes = msg.serialize().unwrap();
        assert_eq!(bytes[0], CMD_ACTION_RESPONSE);
        assert_eq!(bytes[17], 0x00);
        assert_eq!(bytes[18], 1);
        assert_eq!(&bytes[19..], &[ATTR_LARGE_ICON, 4, 0, 0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_attribute_count_mismatch_is_truncated() {
        let mut raw = vec![CMD_INVOKE_ACTION];
        raw.extend_from_slice(Uuid::nil().as_bytes());
        raw.push(0);
        raw.push(2);
        raw.extend_from_slice(&[0x01, 0, 0]);
        assert!(matches!(
            TimelineActionMessage::deserialize(&raw),
            Err(PebblewireError::TruncatedInput { .. })
        ));
    }

    #[test]
    fn test_other_response_code_round_trips() {
        let item = Uuid::from_u128(0x77);
        for code in [0u8, 1, 0x30] {
            let msg = TimelineActionMessage::ActionResponse {
                item_id: item,
                response: ActionResponseCode::Other(code),
                attributes: vec![],
            };
            let bytes = msg.serialize().unwrap();
            assert_eq!(bytes[17], code);
            let decoded = TimelineActionMessage::deserialize(&bytes).unwrap();
            assert_eq!(decoded, msg);
        }
        assert_eq!(ActionResponseCode::from_code(1), ActionResponseCode::Nack);
        assert_ne!(ActionResponseCode::Other(2), ActionResponseCode::Nack);
    }

    #[test]
    fn test_subtitle_attribute() {
        let attr = TimelineAttribute::subtitle("Sent");
        assert_eq!(attr.id, ATTR_SUBTITLE);
        assert_eq!(&attr.content[..], b"Sent");
    }
}
