//! MAVLink v2 framing for the SERIAL_CONTROL message.
//!
//! Only the one message we tunnel through is encoded and decoded here;
//! everything else on the link (heartbeats, status text) is skipped by
//! declared length. The v2 rules that matter for interop are the
//! trailing-zero payload truncation on encode, the matching zero
//! extension on decode, and the per-message CRC seed byte.

/// MAVLink v2 frame start marker.
pub const MAGIC_V2: u8 = 0xFD;
/// MAVLink v1 frame start marker. Never parsed, only recognized so a
/// misconfigured v1 link can be called out in diagnostics.
pub const MAGIC_V1: u8 = 0xFE;

/// SERIAL_CONTROL message id.
pub const SERIAL_CONTROL_ID: u32 = 126;
/// CRC seed byte for SERIAL_CONTROL, from the message definition.
const SERIAL_CONTROL_CRC_EXTRA: u8 = 220;

/// Fixed width of the SERIAL_CONTROL data field. Payloads longer than
/// this are split into multiple messages.
pub const CHUNK_SIZE: usize = 70;

/// SERIAL_CONTROL payload width with both extension fields present.
/// baudrate(4) + timeout(2) + device(1) + flags(1) + count(1) + data(70)
/// + target_system(1) + target_component(1).
const PAYLOAD_FULL: usize = 81;

/// v2 header: magic, len, incompat, compat, seq, sysid, compid, msgid(3).
const HEADER_LEN: usize = 10;
const CHECKSUM_LEN: usize = 2;
const SIGNATURE_LEN: usize = 13;
const INCOMPAT_SIGNED: u8 = 0x01;

/// SERIAL_CONTROL flag bits.
pub mod flags {
    /// Message carries data read from the device.
    pub const REPLY: u8 = 1;
    /// Sender wants any buffered device output returned.
    pub const RESPOND: u8 = 2;
    /// Lock the device against other users while the tunnel is active.
    pub const EXCLUSIVE: u8 = 4;
    /// Block until all data has been written.
    pub const BLOCKING: u8 = 8;
    /// More reads expected; keep the device routed to us.
    pub const MULTI: u8 = 16;
}

/// One SERIAL_CONTROL message, fields in definition order rather than
/// wire order (the wire sorts by field size).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialControl {
    pub device: u8,
    pub flags: u8,
    pub timeout: u16,
    pub baudrate: u32,
    pub count: u8,
    pub data: [u8; CHUNK_SIZE],
}

impl SerialControl {
    /// The valid prefix of the data field.
    pub fn chunk(&self) -> &[u8] {
        let count = (self.count as usize).min(CHUNK_SIZE);
        &self.data[..count]
    }

    /// True when every carried byte is zero. Autopilots answer polls
    /// with zero-filled buffers when the device had nothing to say.
    pub fn is_all_zero(&self) -> bool {
        self.chunk().iter().all(|&b| b == 0)
    }

    /// Serialize to the full 81-byte wire payload (size-sorted field
    /// order, extension fields zeroed).
    fn to_payload(&self) -> [u8; PAYLOAD_FULL] {
        let mut out = [0u8; PAYLOAD_FULL];
        out[0..4].copy_from_slice(&self.baudrate.to_le_bytes());
        out[4..6].copy_from_slice(&self.timeout.to_le_bytes());
        out[6] = self.device;
        out[7] = self.flags;
        out[8] = self.count;
        out[9..9 + CHUNK_SIZE].copy_from_slice(&self.data);
        out
    }

    /// Deserialize from a possibly truncated wire payload. v2 strips
    /// trailing zeros, so anything short of 81 bytes is zero-extended
    /// before the fields are read back out.
    fn from_payload(payload: &[u8]) -> Self {
        let mut full = [0u8; PAYLOAD_FULL];
        let n = payload.len().min(PAYLOAD_FULL);
        full[..n].copy_from_slice(&payload[..n]);

        let mut data = [0u8; CHUNK_SIZE];
        data.copy_from_slice(&full[9..9 + CHUNK_SIZE]);
        SerialControl {
            baudrate: u32::from_le_bytes([full[0], full[1], full[2], full[3]]),
            timeout: u16::from_le_bytes([full[4], full[5]]),
            device: full[6],
            flags: full[7],
            count: full[8],
            data,
        }
    }
}

/// X.25 / MCRF4XX checksum used by MAVLink frames.
fn x25_step(crc: u16, byte: u8) -> u16 {
    let mut tmp = byte ^ (crc & 0x00FF) as u8;
    tmp ^= tmp << 4;
    (crc >> 8) ^ ((tmp as u16) << 8) ^ ((tmp as u16) << 3) ^ ((tmp as u16) >> 4)
}

fn frame_checksum(body: &[u8], crc_extra: u8) -> u16 {
    let crc = body.iter().fold(0xFFFFu16, |crc, &b| x25_step(crc, b));
    x25_step(crc, crc_extra)
}

/// Stateful encoder. Holds the outgoing sequence counter and the
/// identity we claim on the link.
#[derive(Debug)]
pub struct MavCodec {
    seq: u8,
    system_id: u8,
    component_id: u8,
}

impl MavCodec {
    pub fn new(system_id: u8, component_id: u8) -> Self {
        MavCodec { seq: 0, system_id, component_id }
    }

    /// Encode one SERIAL_CONTROL as a v2 frame, truncating trailing
    /// payload zeros down to a minimum of one byte.
    pub fn encode(&mut self, msg: &SerialControl) -> Vec<u8> {
        let payload = msg.to_payload();
        let mut len = PAYLOAD_FULL;
        while len > 1 && payload[len - 1] == 0 {
            len -= 1;
        }

        let mut frame = Vec::with_capacity(HEADER_LEN + len + CHECKSUM_LEN);
        frame.push(MAGIC_V2);
        frame.push(len as u8);
        frame.push(0); // incompat flags
        frame.push(0); // compat flags
        frame.push(self.seq);
        frame.push(self.system_id);
        frame.push(self.component_id);
        frame.extend_from_slice(&SERIAL_CONTROL_ID.to_le_bytes()[..3]);
        frame.extend_from_slice(&payload[..len]);

        let crc = frame_checksum(&frame[1..], SERIAL_CONTROL_CRC_EXTRA);
        frame.extend_from_slice(&crc.to_le_bytes());

        self.seq = self.seq.wrapping_add(1);
        frame
    }
}

/// Incremental v2 frame parser that yields SERIAL_CONTROL messages.
///
/// Frames for other message ids are skipped by their declared length
/// without checksum verification; we only know the CRC seed for the one
/// message we care about. A SERIAL_CONTROL frame with a bad checksum
/// causes a one-byte resync past the start marker.
#[derive(Debug, Default)]
pub struct MavParser {
    buf: Vec<u8>,
}

impl MavParser {
    pub fn new() -> Self {
        MavParser::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SerialControl> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();

        loop {
            let Some(start) = self.buf.iter().position(|&b| b == MAGIC_V2) else {
                // Nothing resembling a frame start; the whole buffer is noise.
                self.buf.clear();
                break;
            };
            if start > 0 {
                self.buf.drain(..start);
            }
            if self.buf.len() < HEADER_LEN {
                break;
            }

            let payload_len = self.buf[1] as usize;
            let signature = if self.buf[2] & INCOMPAT_SIGNED != 0 {
                SIGNATURE_LEN
            } else {
                0
            };
            let total = HEADER_LEN + payload_len + CHECKSUM_LEN + signature;
            if self.buf.len() < total {
                break;
            }

            let msg_id = u32::from_le_bytes([self.buf[7], self.buf[8], self.buf[9], 0]);
            if msg_id != SERIAL_CONTROL_ID {
                self.buf.drain(..total);
                continue;
            }

            let body_end = HEADER_LEN + payload_len;
            let expected = frame_checksum(&self.buf[1..body_end], SERIAL_CONTROL_CRC_EXTRA);
            let found = u16::from_le_bytes([self.buf[body_end], self.buf[body_end + 1]]);
            if expected != found {
                tracing::trace!(expected, found, "serial_control checksum mismatch, resyncing");
                self.buf.drain(..1);
                continue;
            }

            out.push(SerialControl::from_payload(
                &self.buf[HEADER_LEN..body_end],
            ));
            self.buf.drain(..total);
        }

        out
    }

    /// Bytes buffered awaiting frame completion.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(count: u8, fill: &[u8]) -> SerialControl {
        let mut data = [0u8; CHUNK_SIZE];
        data[..fill.len()].copy_from_slice(fill);
        SerialControl {
            device: 3,
            flags: flags::EXCLUSIVE,
            timeout: 0,
            baudrate: 115_200,
            count,
            data,
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let msg = sample(5, b"hello");
        let mut codec = MavCodec::new(255, 190);
        let frame = codec.encode(&msg);

        let mut parser = MavParser::new();
        let decoded = parser.feed(&frame);
        assert_eq!(decoded, vec![msg]);
        assert_eq!(parser.pending(), 0);
    }

    #[test]
    fn encode_truncates_trailing_zeros() {
        // count=3, data has three leading bytes, extensions are zero:
        // payload on the wire should stop right after the data prefix.
        let msg = sample(3, &[1, 2, 3]);
        let mut codec = MavCodec::new(1, 1);
        let frame = codec.encode(&msg);

        let payload_len = frame[1] as usize;
        assert_eq!(payload_len, 9 + 3);
        assert_eq!(frame.len(), HEADER_LEN + payload_len + CHECKSUM_LEN);
    }

    #[test]
    fn decode_zero_extends_truncated_payload() {
        let msg = sample(1, &[0x42]);
        let mut codec = MavCodec::new(1, 1);
        let frame = codec.encode(&msg);

        let mut parser = MavParser::new();
        let decoded = parser.feed(&frame);
        assert_eq!(decoded[0].chunk(), &[0x42]);
        assert_eq!(decoded[0].data[1..], [0u8; CHUNK_SIZE - 1]);
    }

    #[test]
    fn sequence_counter_advances_and_wraps() {
        let mut codec = MavCodec::new(1, 1);
        codec.seq = 255;
        let msg = sample(1, &[0x01]);
        let a = codec.encode(&msg);
        let b = codec.encode(&msg);
        assert_eq!(a[4], 255);
        assert_eq!(b[4], 0);
    }

    #[test]
    fn parser_skips_garbage_before_frame() {
        let msg = sample(4, b"data");
        let mut codec = MavCodec::new(1, 1);
        let mut stream = vec![0x00, 0x55, 0xAA, 0x13];
        stream.extend_from_slice(&codec.encode(&msg));

        let mut parser = MavParser::new();
        assert_eq!(parser.feed(&stream), vec![msg]);
    }

    #[test]
    fn parser_skips_other_message_ids() {
        // A minimal foreign frame: msgid 0 (heartbeat), 9-byte payload.
        let mut foreign = vec![MAGIC_V2, 9, 0, 0, 7, 1, 1, 0, 0, 0];
        foreign.extend_from_slice(&[0u8; 9 + 2]);

        let msg = sample(2, b"ok");
        let mut codec = MavCodec::new(1, 1);
        let mut stream = foreign;
        stream.extend_from_slice(&codec.encode(&msg));

        let mut parser = MavParser::new();
        assert_eq!(parser.feed(&stream), vec![msg]);
    }

    #[test]
    fn checksum_mismatch_resyncs_to_next_frame() {
        let msg = sample(6, b"signal");
        let mut codec = MavCodec::new(1, 1);
        let mut bad = codec.encode(&msg);
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;

        let mut stream = bad;
        stream.extend_from_slice(&codec.encode(&msg));

        let mut parser = MavParser::new();
        let decoded = parser.feed(&stream);
        assert_eq!(decoded, vec![msg]);
    }

    #[test]
    fn parser_handles_arbitrary_chunking() {
        let msgs: Vec<SerialControl> = (0..4)
            .map(|i| sample(3, &[i, i + 1, i + 2]))
            .collect();
        let mut codec = MavCodec::new(1, 1);
        let stream: Vec<u8> = msgs.iter().flat_map(|m| codec.encode(m)).collect();

        for chunk_size in [1usize, 3, 8, 64] {
            let mut parser = MavParser::new();
            let mut decoded = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                decoded.extend(parser.feed(chunk));
            }
            assert_eq!(decoded, msgs, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn parser_clears_pure_noise() {
        let mut parser = MavParser::new();
        assert!(parser.feed(&[0x00; 256]).is_empty());
        assert_eq!(parser.pending(), 0);
    }

    #[test]
    fn all_zero_detection() {
        assert!(sample(4, &[0, 0, 0, 0]).is_all_zero());
        assert!(!sample(4, &[0, 0, 1, 0]).is_all_zero());
        // count=0 carries nothing, trivially all zero
        assert!(sample(0, &[]).is_all_zero());
    }
}
