use anyhow::{Result, anyhow, bail};
use std::sync::atomic::{AtomicU32, Ordering};

/// Wire type tags. DATA_RAW has its own tag so raw streams are matched by
/// `fetch_data` and never dispatched through `check_mail`.
pub const MSG_TASK_NEW: u8 = 1;
pub const MSG_TASK_FINISHED: u8 = 2;
pub const MSG_SATISFIABILITY: u8 = 3;
pub const MSG_REMOTE_ACCESS_RELEASE: u8 = 4;
pub const MSG_DFREE: u8 = 5;
pub const MSG_SYS_FINISH: u8 = 6;
pub const MSG_DATA_RAW: u8 = 7;

/// Fixed wire header: 1-byte type, 4-byte id, 4-byte payload size.
pub const HEADER_LEN: usize = 9;

/// Low bits of a message id hold the per-node counter; the rank sits above.
const MESSAGE_ID_RANK_SHIFT: u32 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub kind: u8,
    pub id: u32,
    pub size: u32,
}

/// Globally unique message ids: `(sender_rank << 24) | local_counter`.
pub struct MessageIdAllocator {
    rank_tag: u32,
    counter: AtomicU32,
}

impl MessageIdAllocator {
    pub fn new(rank: usize) -> Self {
        Self {
            rank_tag: (rank as u32) << MESSAGE_ID_RANK_SHIFT,
            counter: AtomicU32::new(1),
        }
    }

    pub fn next(&self) -> u32 {
        self.rank_tag | (self.counter.fetch_add(1, Ordering::Relaxed) & 0x00ff_ffff)
    }
}

/// Per-access payload of a TaskNew: the declared shape plus the
/// satisfiability known at offload time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessInfo {
    pub access_type: u8,
    pub weak: bool,
    pub start: u64,
    pub len: u64,
    pub read_satisfied: bool,
    pub write_satisfied: bool,
    pub write_id: u64,
    /// Home of the current value, -1 when unknown.
    pub location: i32,
    /// Offloader task id of a predecessor offloaded to the same node, 0 when
    /// remote propagation is not valid.
    pub namespace_predecessor: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskNewMsg {
    pub offloader_node: u32,
    pub offloader_task: u64,
    pub label: String,
    pub args: Vec<u8>,
    pub priority: i64,
    pub accesses: Vec<AccessInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SatisfiabilityMsg {
    pub offloader_node: u32,
    pub offloader_task: u64,
    pub start: u64,
    pub len: u64,
    pub read: bool,
    pub write: bool,
    pub write_id: u64,
    pub location: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteAccessReleaseMsg {
    pub offloader_task: u64,
    pub start: u64,
    pub len: u64,
    pub write_id: u64,
    pub location: i32,
}

/// Every control message on the wire. Decoding is an exhaustive match on
/// the type byte; an unknown tag is a protocol violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    TaskNew(TaskNewMsg),
    TaskFinished { offloader_task: u64 },
    Satisfiability(SatisfiabilityMsg),
    RemoteAccessRelease(RemoteAccessReleaseMsg),
    Dfree { start: u64, len: u64 },
    SysFinish,
}

impl Message {
    pub fn kind(&self) -> u8 {
        match self {
            Message::TaskNew(_) => MSG_TASK_NEW,
            Message::TaskFinished { .. } => MSG_TASK_FINISHED,
            Message::Satisfiability(_) => MSG_SATISFIABILITY,
            Message::RemoteAccessRelease(_) => MSG_REMOTE_ACCESS_RELEASE,
            Message::Dfree { .. } => MSG_DFREE,
            Message::SysFinish => MSG_SYS_FINISH,
        }
    }

    pub fn encode(&self, id: u32) -> Vec<u8> {
        let mut payload = Vec::new();
        match self {
            Message::TaskNew(m) => {
                put_u32(&mut payload, m.offloader_node);
                put_u64(&mut payload, m.offloader_task);
                put_bytes(&mut payload, m.label.as_bytes());
                put_bytes(&mut payload, &m.args);
                put_u64(&mut payload, m.priority as u64);
                put_u32(&mut payload, m.accesses.len() as u32);
                for a in &m.accesses {
                    payload.push(a.access_type);
                    payload.push(a.weak as u8);
                    put_u64(&mut payload, a.start);
                    put_u64(&mut payload, a.len);
                    payload.push(a.read_satisfied as u8);
                    payload.push(a.write_satisfied as u8);
                    put_u64(&mut payload, a.write_id);
                    put_u32(&mut payload, a.location as u32);
                    put_u64(&mut payload, a.namespace_predecessor);
                }
            }
            Message::TaskFinished { offloader_task } => put_u64(&mut payload, *offloader_task),
            Message::Satisfiability(m) => {
                put_u32(&mut payload, m.offloader_node);
                put_u64(&mut payload, m.offloader_task);
                put_u64(&mut payload, m.start);
                put_u64(&mut payload, m.len);
                payload.push(m.read as u8);
                payload.push(m.write as u8);
                put_u64(&mut payload, m.write_id);
                put_u32(&mut payload, m.location as u32);
            }
            Message::RemoteAccessRelease(m) => {
                put_u64(&mut payload, m.offloader_task);
                put_u64(&mut payload, m.start);
                put_u64(&mut payload, m.len);
                put_u64(&mut payload, m.write_id);
                put_u32(&mut payload, m.location as u32);
            }
            Message::Dfree { start, len } => {
                put_u64(&mut payload, *start);
                put_u64(&mut payload, *len);
            }
            Message::SysFinish => {}
        }

        let mut wire = Vec::with_capacity(HEADER_LEN + payload.len());
        wire.push(self.kind());
        put_u32(&mut wire, id);
        put_u32(&mut wire, payload.len() as u32);
        wire.extend_from_slice(&payload);
        wire
    }

    pub fn decode(wire: &[u8]) -> Result<(MessageHeader, Message)> {
        if wire.len() < HEADER_LEN {
            bail!("truncated message header: {} bytes", wire.len());
        }
        let header = MessageHeader {
            kind: wire[0],
            id: u32::from_le_bytes(wire[1..5].try_into().expect("sized slice")),
            size: u32::from_le_bytes(wire[5..9].try_into().expect("sized slice")),
        };
        let mut c = Cursor::new(&wire[HEADER_LEN..]);
        if c.remaining() != header.size as usize {
            bail!(
                "payload size mismatch: header says {}, got {}",
                header.size,
                c.remaining()
            );
        }

        let message = match header.kind {
            MSG_TASK_NEW => {
                let offloader_node = c.u32()?;
                let offloader_task = c.u64()?;
                let label = String::from_utf8(c.bytes()?)
                    .map_err(|_| anyhow!("task label is not UTF-8"))?;
                let args = c.bytes()?;
                let priority = c.u64()? as i64;
                let count = c.u32()? as usize;
                let mut accesses = Vec::with_capacity(count);
                for _ in 0..count {
                    accesses.push(AccessInfo {
                        access_type: c.u8()?,
                        weak: c.u8()? != 0,
                        start: c.u64()?,
                        len: c.u64()?,
                        read_satisfied: c.u8()? != 0,
                        write_satisfied: c.u8()? != 0,
                        write_id: c.u64()?,
                        location: c.u32()? as i32,
                        namespace_predecessor: c.u64()?,
                    });
                }
                Message::TaskNew(TaskNewMsg {
                    offloader_node,
                    offloader_task,
                    label,
                    args,
                    priority,
                    accesses,
                })
            }
            MSG_TASK_FINISHED => Message::TaskFinished {
                offloader_task: c.u64()?,
            },
            MSG_SATISFIABILITY => Message::Satisfiability(SatisfiabilityMsg {
                offloader_node: c.u32()?,
                offloader_task: c.u64()?,
                start: c.u64()?,
                len: c.u64()?,
                read: c.u8()? != 0,
                write: c.u8()? != 0,
                write_id: c.u64()?,
                location: c.u32()? as i32,
            }),
            MSG_REMOTE_ACCESS_RELEASE => Message::RemoteAccessRelease(RemoteAccessReleaseMsg {
                offloader_task: c.u64()?,
                start: c.u64()?,
                len: c.u64()?,
                write_id: c.u64()?,
                location: c.u32()? as i32,
            }),
            MSG_DFREE => Message::Dfree {
                start: c.u64()?,
                len: c.u64()?,
            },
            MSG_SYS_FINISH => Message::SysFinish,
            other => bail!("unknown message type tag {other:#04x}"),
        };
        Ok((header, message))
    }
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(buf, bytes.len() as u32);
    buf.extend_from_slice(bytes);
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            bail!("truncated payload: wanted {n}, have {}", self.remaining());
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("sized")))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("sized")))
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn message_ids_are_globally_unique() {
        let a = MessageIdAllocator::new(0);
        let b = MessageIdAllocator::new(1);
        assert_ne!(a.next(), b.next());
        assert_eq!(b.next() >> MESSAGE_ID_RANK_SHIFT, 1);

        let first = a.next();
        let second = a.next();
        assert_eq!(second, first + 1);
    }

    #[rstest]
    #[case::sys_finish(Message::SysFinish)]
    #[case::task_finished(Message::TaskFinished { offloader_task: 42 })]
    #[case::dfree(Message::Dfree { start: 0x1000, len: 0x800 })]
    #[case::satisfiability(Message::Satisfiability(SatisfiabilityMsg {
        offloader_node: 0,
        offloader_task: 7,
        start: 0x2000,
        len: 64,
        read: true,
        write: false,
        write_id: 99,
        location: 1,
    }))]
    fn wire_roundtrip(#[case] message: Message) {
        let wire = message.encode(0x0100_0007);
        let (header, decoded) = Message::decode(&wire).unwrap();
        assert_eq!(header.kind, message.kind());
        assert_eq!(header.id, 0x0100_0007);
        assert_eq!(decoded, message);
    }

    #[test]
    fn task_new_carries_accesses() {
        let message = Message::TaskNew(TaskNewMsg {
            offloader_node: 0,
            offloader_task: 3,
            label: "stencil".into(),
            args: vec![1, 2, 3, 4],
            priority: -2,
            accesses: vec![AccessInfo {
                access_type: 2,
                weak: false,
                start: 0x4000,
                len: 256,
                read_satisfied: true,
                write_satisfied: false,
                write_id: 11,
                location: 0,
                namespace_predecessor: 2,
            }],
        });
        let wire = message.encode(1);
        let (_, decoded) = Message::decode(&wire).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut wire = Message::SysFinish.encode(1);
        wire[0] = 0xee;
        assert!(Message::decode(&wire).is_err());
    }
}
