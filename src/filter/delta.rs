use std::io::{Read, Write};

const MAX_DISTANCE: usize = 256;
const DIS_MASK: usize = MAX_DISTANCE - 1;

/// Circular-history delta (the XZ Utils state machine): a 256-byte
/// wrap-around history and a backward-stepping position, carried across
/// calls.
pub(crate) struct Delta {
    distance: usize,
    history: [u8; MAX_DISTANCE],
    pos: u8,
}

impl Delta {
    pub(crate) fn new(distance: usize) -> Self {
        Self {
            distance,
            history: [0; MAX_DISTANCE],
            pos: 0,
        }
    }

    pub(crate) fn decode(&mut self, buf: &mut [u8]) {
        for item in buf {
            let pos = self.pos as usize;
            let reference = self.history[self.distance.wrapping_add(pos) & DIS_MASK];
            *item = item.wrapping_add(reference);
            self.history[pos & DIS_MASK] = *item;
            self.pos = self.pos.wrapping_sub(1);
        }
    }

    pub(crate) fn encode(&mut self, buf: &mut [u8]) {
        for item in buf {
            let pos = self.pos as usize;
            let reference = self.history[self.distance.wrapping_add(pos) & DIS_MASK];
            let original = *item;
            *item = item.wrapping_sub(reference);
            self.history[pos & DIS_MASK] = original;
            self.pos = self.pos.wrapping_sub(1);
        }
    }
}

/// Simple-forward delta (the 7z reading): `out[i] = in[i] - in[i - d]` with
/// indices relative to the buffer, bytes before one distance passing
/// through.
pub(crate) fn simple_forward_encode(buf: &mut [u8], distance: usize) {
    for i in (distance..buf.len()).rev() {
        buf[i] = buf[i].wrapping_sub(buf[i - distance]);
    }
}

pub(crate) fn simple_forward_decode(buf: &mut [u8], distance: usize) {
    for i in distance..buf.len() {
        buf[i] = buf[i].wrapping_add(buf[i - distance]);
    }
}

/// Decodes delta-filtered bytes pulled from an inner reader.
pub struct DeltaReader<R> {
    inner: R,
    delta: Delta,
}

impl<R> DeltaReader<R> {
    /// Wraps `inner` with a fresh history at `distance`.
    pub fn new(inner: R, distance: usize) -> Self {
        Self {
            inner,
            delta: Delta::new(distance),
        }
    }
}

impl<R: Read> Read for DeltaReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 {
            return Ok(n);
        }
        self.delta.decode(&mut buf[..n]);
        Ok(n)
    }
}

/// Delta-filters bytes on their way into an inner writer.
pub struct DeltaWriter<W> {
    inner: W,
    delta: Delta,
    buffer: Vec<u8>,
}

impl<W> DeltaWriter<W> {
    /// Wraps `inner` with a fresh history at `distance`.
    pub fn new(inner: W, distance: usize) -> Self {
        Self {
            inner,
            delta: Delta::new(distance),
            buffer: Vec::with_capacity(4096),
        }
    }
}

impl<W: Write> Write for DeltaWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.buffer.len() < buf.len() {
            self.buffer.resize(buf.len(), 0);
        }
        self.buffer[..buf.len()].copy_from_slice(buf);
        self.delta.encode(&mut self.buffer[..buf.len()]);
        self.inner.write(&self.buffer[..buf.len()])
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn simple_forward_matches_reference_vector() {
        let mut data = [0x01, 0x02, 0x04, 0x07, 0x0B, 0x10];
        simple_forward_encode(&mut data, 2);
        assert_eq!(data, [0x01, 0x02, 0x03, 0x05, 0x07, 0x09]);
        simple_forward_decode(&mut data, 2);
        assert_eq!(data, [0x01, 0x02, 0x04, 0x07, 0x0B, 0x10]);
    }

    #[test]
    fn variants_agree_on_contiguous_streams() {
        let original: Vec<u8> = (0..600u32).map(|i| (i * 7 % 256) as u8).collect();
        for distance in [1usize, 2, 5, 256] {
            let mut simple = original.clone();
            simple_forward_encode(&mut simple, distance);
            let mut history = original.clone();
            Delta::new(distance).encode(&mut history);
            assert_eq!(simple, history, "distance {distance}");
        }
    }

    #[test]
    fn history_state_survives_chunked_processing() {
        let original: Vec<u8> = (0..1000u32).map(|i| (i * 13 % 256) as u8).collect();
        let mut whole = original.clone();
        Delta::new(7).encode(&mut whole);

        let mut chunked = original.clone();
        let mut delta = Delta::new(7);
        let (head, tail) = chunked.split_at_mut(333);
        delta.encode(head);
        delta.encode(tail);
        assert_eq!(whole, chunked);
    }

    #[test]
    fn reader_writer_roundtrip() {
        let cases: &[Vec<u8>] = &[
            vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10],
            vec![0, 255, 0, 255, 0, 255],
            vec![100; 20],
            (0..300).map(|i| (i % 256) as u8).collect(),
        ];
        for distance in [1usize, 2, 4, 16, 256] {
            for original in cases {
                let mut encoded = Vec::new();
                let mut writer = DeltaWriter::new(Cursor::new(&mut encoded), distance);
                std::io::copy(&mut original.as_slice(), &mut writer).unwrap();

                let mut decoded = Vec::new();
                let mut reader = DeltaReader::new(Cursor::new(&encoded), distance);
                std::io::copy(&mut reader, &mut decoded).unwrap();
                assert_eq!(original, &decoded, "distance {distance}");
            }
        }
    }
}
