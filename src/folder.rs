//! The 7z "folder": one solid compression unit whose coders form a small
//! DAG. Bind pairs connect coder output streams to coder input streams;
//! the remaining unbound input streams consume pack streams.

#[derive(Debug, Default, Clone)]
pub struct Folder {
    /// Coders of this folder in on-disk order.
    pub coders: Vec<Coder>,
    /// Whether a CRC-32 over the folder output is recorded.
    pub has_crc: bool,
    /// CRC-32 over the concatenated decoded output.
    pub crc: u64,
    pub(crate) total_input_streams: usize,
    pub(crate) total_output_streams: usize,
    pub(crate) bind_pairs: Vec<BindPair>,
    pub(crate) packed_streams: Vec<u64>,
    pub(crate) unpack_sizes: Vec<u64>,
    pub(crate) num_unpack_sub_streams: usize,
}

impl Folder {
    pub(crate) fn find_bind_pair_for_in_stream(&self, index: usize) -> Option<usize> {
        let index = index as u64;
        (0..self.bind_pairs.len()).find(|&i| self.bind_pairs[i].in_index == index)
    }

    pub(crate) fn find_bind_pair_for_out_stream(&self, index: usize) -> Option<usize> {
        let index = index as u64;
        (0..self.bind_pairs.len()).find(|&i| self.bind_pairs[i].out_index == index)
    }

    /// The folder's declared unpacked size: the size at its unbound output.
    pub fn unpack_size(&self) -> u64 {
        for i in (0..self.total_output_streams).rev() {
            if self.find_bind_pair_for_out_stream(i).is_none() {
                return self.unpack_sizes[i];
            }
        }
        0
    }

    /// The unpacked size at coder `index`'s output.
    pub fn unpack_size_at_index(&self, index: usize) -> u64 {
        self.unpack_sizes.get(index).copied().unwrap_or_default()
    }

    /// Walks the coder chain from the pack side outward.
    pub fn ordered_coder_iter(&self) -> OrderedCoderIter<'_> {
        OrderedCoderIter::new(self)
    }
}

/// A coder record: method id, stream counts, and its properties blob.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Coder {
    method_id: [u8; 0xF],
    pub(crate) id_size: usize,
    pub(crate) num_in_streams: u64,
    pub(crate) num_out_streams: u64,
    pub(crate) properties: Vec<u8>,
}

impl Coder {
    /// Creates a single-input, single-output coder record.
    pub fn new(id: &[u8], properties: Vec<u8>) -> Self {
        let mut method_id = [0u8; 0xF];
        method_id[..id.len()].copy_from_slice(id);
        Self {
            method_id,
            id_size: id.len(),
            num_in_streams: 1,
            num_out_streams: 1,
            properties,
        }
    }

    /// The coder's on-disk method id.
    pub fn method_id(&self) -> &[u8] {
        &self.method_id[0..self.id_size]
    }

    pub(crate) fn method_id_mut(&mut self) -> &mut [u8] {
        &mut self.method_id[0..self.id_size]
    }
}

/// Connects the producing coder's output stream to a consuming coder's
/// input stream; stored as dense index pairs, never as pointers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BindPair {
    pub(crate) in_index: u64,
    pub(crate) out_index: u64,
}

/// Yields `(coder_index, coder)` starting at the coder that reads the pack
/// stream and following bind pairs toward the folder output.
pub struct OrderedCoderIter<'a> {
    folder: &'a Folder,
    current: Option<u64>,
}

impl<'a> OrderedCoderIter<'a> {
    fn new(folder: &'a Folder) -> Self {
        let current = folder.packed_streams.first().copied();
        Self { folder, current }
    }
}

impl<'a> Iterator for OrderedCoderIter<'a> {
    type Item = (usize, &'a Coder);

    fn next(&mut self) -> Option<Self::Item> {
        let i = self.current?;
        self.current = self
            .folder
            .find_bind_pair_for_out_stream(i as usize)
            .map(|pair| self.folder.bind_pairs[pair].in_index);
        self.folder
            .coders
            .get(i as usize)
            .map(|coder| (i as usize, coder))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::CoderId;

    fn linear_folder() -> Folder {
        // LZMA2 reads the pack stream (coder 0); Delta post-processes it.
        Folder {
            coders: vec![
                Coder::new(CoderId::ID_LZMA2, vec![0x08]),
                Coder::new(CoderId::ID_DELTA, vec![0x00]),
            ],
            total_input_streams: 2,
            total_output_streams: 2,
            bind_pairs: vec![BindPair {
                in_index: 1,
                out_index: 0,
            }],
            packed_streams: vec![0],
            unpack_sizes: vec![100, 100],
            num_unpack_sub_streams: 1,
            ..Default::default()
        }
    }

    #[test]
    fn ordered_iteration_follows_bind_pairs() {
        let folder = linear_folder();
        let order: Vec<usize> = folder.ordered_coder_iter().map(|(i, _)| i).collect();
        assert_eq!(order, vec![0, 1]);
    }

    #[test]
    fn unpack_size_is_the_unbound_output() {
        let mut folder = linear_folder();
        folder.unpack_sizes = vec![512, 100];
        // output stream 1 (Delta) has no bind pair, so its size wins
        assert_eq!(folder.unpack_size(), 100);
    }
}
