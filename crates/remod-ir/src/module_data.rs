//! Module data containers: orders, patterns, rows, and metadata.
//!
//! Formats store pattern data in one of two layouts:
//!
//! * [`CorData`]: channel, then order, then row. Each channel has its own
//!   pattern-id space (Deflemask style).
//! * [`OrcData`]: order, then row, then channel. One pattern table shared by all
//!   channels (ProTracker style).
//!
//! Both expose the same three-phase initialization: allocate the pattern
//! matrix, fill in pattern ids, allocate channels (which counts distinct
//! patterns), then allocate pattern storage. Rows must not be read between
//! phases. Two orders referencing the same pattern id share one backing
//! row buffer.

use std::fmt;

pub type OrderIndex = u16;
pub type PatternIndex = u16;
pub type ChannelIndex = u8;
pub type RowIndex = u16;

/// Per-format type bundle consumed by the data containers.
pub trait ModuleFormat {
    type Row: Clone + Default;
    type ChannelMetadata: Clone + Default;
    type PatternMetadata: Clone + Default;
    type GlobalData: Default;
}

/// Channel → order → row storage with per-channel pattern-id spaces.
pub struct CorData<F: ModuleFormat> {
    num_channels: ChannelIndex,
    num_orders: OrderIndex,
    num_rows: RowIndex,
    pattern_matrix: Vec<Vec<PatternIndex>>, // [channel][order]
    num_patterns: Vec<PatternIndex>,        // [channel]
    patterns: Vec<Vec<Vec<F::Row>>>,        // [channel][pattern id][row]
    pattern_metadata: Vec<Vec<F::PatternMetadata>>, // [channel][pattern id]
    channel_metadata: Vec<F::ChannelMetadata>, // [channel]
    global: F::GlobalData,
}

impl<F: ModuleFormat> Default for CorData<F> {
    fn default() -> Self {
        Self {
            num_channels: 0,
            num_orders: 0,
            num_rows: 0,
            pattern_matrix: Vec::new(),
            num_patterns: Vec::new(),
            patterns: Vec::new(),
            pattern_metadata: Vec::new(),
            channel_metadata: Vec::new(),
            global: F::GlobalData::default(),
        }
    }
}

impl<F: ModuleFormat> CorData<F> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Phase 1: size the pattern matrix. Discards any previous contents.
    pub fn allocate_pattern_matrix(
        &mut self,
        channels: ChannelIndex,
        orders: OrderIndex,
        rows: RowIndex,
    ) {
        self.num_channels = channels;
        self.num_orders = orders;
        self.num_rows = rows;
        self.num_patterns.clear();
        self.patterns.clear();
        self.pattern_metadata.clear();
        self.channel_metadata.clear();
        self.pattern_matrix = vec![vec![0; orders as usize]; channels as usize];
    }

    /// Phase 2: count distinct patterns per channel and size channel
    /// metadata. Call after every pattern id is set.
    pub fn allocate_channels(&mut self) {
        debug_assert!(!self.pattern_matrix.is_empty(), "pattern matrix not allocated");
        self.num_patterns = self
            .pattern_matrix
            .iter()
            .map(|channel| channel.iter().copied().max().unwrap_or(0) + 1)
            .collect();
        self.channel_metadata = vec![F::ChannelMetadata::default(); self.num_channels as usize];
    }

    /// Phase 3: allocate row storage for every `(channel, pattern id)`.
    pub fn allocate_patterns(&mut self) {
        debug_assert!(!self.num_patterns.is_empty(), "channels not allocated");
        self.patterns = self
            .num_patterns
            .iter()
            .map(|&n| vec![vec![F::Row::default(); self.num_rows as usize]; n as usize])
            .collect();
        self.pattern_metadata = self
            .num_patterns
            .iter()
            .map(|&n| vec![F::PatternMetadata::default(); n as usize])
            .collect();
    }

    pub fn num_channels(&self) -> ChannelIndex {
        self.num_channels
    }

    pub fn num_orders(&self) -> OrderIndex {
        self.num_orders
    }

    pub fn num_rows(&self) -> RowIndex {
        self.num_rows
    }

    pub fn pattern_id(&self, channel: ChannelIndex, order: OrderIndex) -> PatternIndex {
        self.pattern_matrix[channel as usize][order as usize]
    }

    pub fn set_pattern_id(
        &mut self,
        channel: ChannelIndex,
        order: OrderIndex,
        pattern_id: PatternIndex,
    ) {
        self.pattern_matrix[channel as usize][order as usize] = pattern_id;
    }

    /// Distinct patterns in the given channel (1 + max pattern id).
    pub fn num_patterns(&self, channel: ChannelIndex) -> PatternIndex {
        self.num_patterns[channel as usize]
    }

    pub fn row(&self, channel: ChannelIndex, order: OrderIndex, row: RowIndex) -> &F::Row {
        self.row_by_id(channel, self.pattern_id(channel, order), row)
    }

    pub fn set_row(
        &mut self,
        channel: ChannelIndex,
        order: OrderIndex,
        row: RowIndex,
        value: F::Row,
    ) {
        let pattern_id = self.pattern_id(channel, order);
        self.set_row_by_id(channel, pattern_id, row, value);
    }

    pub fn row_by_id(
        &self,
        channel: ChannelIndex,
        pattern_id: PatternIndex,
        row: RowIndex,
    ) -> &F::Row {
        debug_assert!(!self.patterns.is_empty(), "patterns not allocated");
        &self.patterns[channel as usize][pattern_id as usize][row as usize]
    }

    pub fn set_row_by_id(
        &mut self,
        channel: ChannelIndex,
        pattern_id: PatternIndex,
        row: RowIndex,
        value: F::Row,
    ) {
        debug_assert!(!self.patterns.is_empty(), "patterns not allocated");
        self.patterns[channel as usize][pattern_id as usize][row as usize] = value;
    }

    pub fn pattern_metadata(
        &self,
        channel: ChannelIndex,
        pattern_id: PatternIndex,
    ) -> &F::PatternMetadata {
        &self.pattern_metadata[channel as usize][pattern_id as usize]
    }

    pub fn set_pattern_metadata(
        &mut self,
        channel: ChannelIndex,
        pattern_id: PatternIndex,
        metadata: F::PatternMetadata,
    ) {
        self.pattern_metadata[channel as usize][pattern_id as usize] = metadata;
    }

    pub fn channel_metadata(&self, channel: ChannelIndex) -> &F::ChannelMetadata {
        &self.channel_metadata[channel as usize]
    }

    pub fn set_channel_metadata(&mut self, channel: ChannelIndex, metadata: F::ChannelMetadata) {
        self.channel_metadata[channel as usize] = metadata;
    }

    pub fn global(&self) -> &F::GlobalData {
        &self.global
    }

    pub fn global_mut(&mut self) -> &mut F::GlobalData {
        &mut self.global
    }
}

impl<F: ModuleFormat> fmt::Debug for CorData<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorData")
            .field("num_channels", &self.num_channels)
            .field("num_orders", &self.num_orders)
            .field("num_rows", &self.num_rows)
            .field("num_patterns", &self.num_patterns)
            .finish_non_exhaustive()
    }
}

/// Order → row → channel storage with a single shared pattern table.
pub struct OrcData<F: ModuleFormat> {
    num_channels: ChannelIndex,
    num_orders: OrderIndex,
    num_rows: RowIndex,
    pattern_matrix: Vec<PatternIndex>, // [order]
    num_patterns: PatternIndex,
    patterns: Vec<Vec<Vec<F::Row>>>, // [pattern id][row][channel]
    pattern_metadata: Vec<F::PatternMetadata>, // [pattern id]
    channel_metadata: Vec<F::ChannelMetadata>, // [channel]
    global: F::GlobalData,
}

impl<F: ModuleFormat> Default for OrcData<F> {
    fn default() -> Self {
        Self {
            num_channels: 0,
            num_orders: 0,
            num_rows: 0,
            pattern_matrix: Vec::new(),
            num_patterns: 0,
            patterns: Vec::new(),
            pattern_metadata: Vec::new(),
            channel_metadata: Vec::new(),
            global: F::GlobalData::default(),
        }
    }
}

impl<F: ModuleFormat> OrcData<F> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Phase 1: size the pattern matrix. Discards any previous contents.
    pub fn allocate_pattern_matrix(
        &mut self,
        channels: ChannelIndex,
        orders: OrderIndex,
        rows: RowIndex,
    ) {
        self.num_channels = channels;
        self.num_orders = orders;
        self.num_rows = rows;
        self.num_patterns = 0;
        self.patterns.clear();
        self.pattern_metadata.clear();
        self.channel_metadata.clear();
        self.pattern_matrix = vec![0; orders as usize];
    }

    /// Phase 2: count distinct patterns and size channel metadata.
    pub fn allocate_channels(&mut self) {
        debug_assert!(!self.pattern_matrix.is_empty(), "pattern matrix not allocated");
        self.num_patterns = self.pattern_matrix.iter().copied().max().unwrap_or(0) + 1;
        self.channel_metadata = vec![F::ChannelMetadata::default(); self.num_channels as usize];
    }

    /// Phase 3: allocate row storage for every pattern id.
    pub fn allocate_patterns(&mut self) {
        debug_assert!(self.num_patterns > 0, "channels not allocated");
        self.patterns = (0..self.num_patterns)
            .map(|_| {
                vec![vec![F::Row::default(); self.num_channels as usize]; self.num_rows as usize]
            })
            .collect();
        self.pattern_metadata = vec![F::PatternMetadata::default(); self.num_patterns as usize];
    }

    pub fn num_channels(&self) -> ChannelIndex {
        self.num_channels
    }

    pub fn num_orders(&self) -> OrderIndex {
        self.num_orders
    }

    pub fn num_rows(&self) -> RowIndex {
        self.num_rows
    }

    pub fn pattern_id(&self, order: OrderIndex) -> PatternIndex {
        self.pattern_matrix[order as usize]
    }

    pub fn set_pattern_id(&mut self, order: OrderIndex, pattern_id: PatternIndex) {
        self.pattern_matrix[order as usize] = pattern_id;
    }

    /// Distinct patterns in the module (1 + max pattern id).
    pub fn num_patterns(&self) -> PatternIndex {
        self.num_patterns
    }

    pub fn row(&self, channel: ChannelIndex, order: OrderIndex, row: RowIndex) -> &F::Row {
        self.row_by_id(channel, self.pattern_id(order), row)
    }

    pub fn set_row(
        &mut self,
        channel: ChannelIndex,
        order: OrderIndex,
        row: RowIndex,
        value: F::Row,
    ) {
        let pattern_id = self.pattern_id(order);
        self.set_row_by_id(channel, pattern_id, row, value);
    }

    pub fn row_by_id(
        &self,
        channel: ChannelIndex,
        pattern_id: PatternIndex,
        row: RowIndex,
    ) -> &F::Row {
        debug_assert!(!self.patterns.is_empty(), "patterns not allocated");
        &self.patterns[pattern_id as usize][row as usize][channel as usize]
    }

    pub fn set_row_by_id(
        &mut self,
        channel: ChannelIndex,
        pattern_id: PatternIndex,
        row: RowIndex,
        value: F::Row,
    ) {
        debug_assert!(!self.patterns.is_empty(), "patterns not allocated");
        self.patterns[pattern_id as usize][row as usize][channel as usize] = value;
    }

    pub fn pattern_metadata(&self, pattern_id: PatternIndex) -> &F::PatternMetadata {
        &self.pattern_metadata[pattern_id as usize]
    }

    pub fn set_pattern_metadata(&mut self, pattern_id: PatternIndex, metadata: F::PatternMetadata) {
        self.pattern_metadata[pattern_id as usize] = metadata;
    }

    pub fn channel_metadata(&self, channel: ChannelIndex) -> &F::ChannelMetadata {
        &self.channel_metadata[channel as usize]
    }

    pub fn set_channel_metadata(&mut self, channel: ChannelIndex, metadata: F::ChannelMetadata) {
        self.channel_metadata[channel as usize] = metadata;
    }

    pub fn global(&self) -> &F::GlobalData {
        &self.global
    }

    pub fn global_mut(&mut self) -> &mut F::GlobalData {
        &mut self.global
    }
}

impl<F: ModuleFormat> fmt::Debug for OrcData<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrcData")
            .field("num_channels", &self.num_channels)
            .field("num_orders", &self.num_orders)
            .field("num_rows", &self.num_rows)
            .field("num_patterns", &self.num_patterns)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct TestFormat;

    impl ModuleFormat for TestFormat {
        type Row = u32;
        type ChannelMetadata = u8;
        type PatternMetadata = String;
        type GlobalData = ();
    }

    fn cor_with_matrix(matrix: &[&[PatternIndex]], rows: RowIndex) -> CorData<TestFormat> {
        let mut data = CorData::new();
        data.allocate_pattern_matrix(matrix.len() as ChannelIndex, matrix[0].len() as OrderIndex, rows);
        for (channel, orders) in matrix.iter().enumerate() {
            for (order, &id) in orders.iter().enumerate() {
                data.set_pattern_id(channel as ChannelIndex, order as OrderIndex, id);
            }
        }
        data.allocate_channels();
        data.allocate_patterns();
        data
    }

    #[test]
    fn cor_counts_patterns_per_channel() {
        let data = cor_with_matrix(&[&[0, 1, 1], &[0, 0, 0]], 4);
        assert_eq!(data.num_patterns(0), 2);
        assert_eq!(data.num_patterns(1), 1);
    }

    #[test]
    fn cor_shared_pattern_id_shares_rows() {
        let mut data = cor_with_matrix(&[&[2, 2]], 4);
        data.set_row(0, 0, 1, 77);
        // Order 1 references the same pattern id, so the row is visible there
        assert_eq!(*data.row(0, 1, 1), 77);
        assert_eq!(*data.row_by_id(0, 2, 1), 77);
    }

    #[test]
    fn cor_pattern_matrix_entries_below_pattern_count() {
        let data = cor_with_matrix(&[&[0, 3, 2], &[1, 1, 0]], 1);
        for channel in 0..data.num_channels() {
            for order in 0..data.num_orders() {
                assert!(data.pattern_id(channel, order) < data.num_patterns(channel));
            }
        }
    }

    #[test]
    fn cor_metadata_round_trip() {
        let mut data = cor_with_matrix(&[&[0, 1]], 2);
        data.set_channel_metadata(0, 4);
        data.set_pattern_metadata(0, 1, "lead".to_string());
        assert_eq!(*data.channel_metadata(0), 4);
        assert_eq!(data.pattern_metadata(0, 1), "lead");
    }

    #[test]
    fn orc_counts_patterns_globally() {
        let mut data: OrcData<TestFormat> = OrcData::new();
        data.allocate_pattern_matrix(4, 3, 64);
        data.set_pattern_id(0, 0);
        data.set_pattern_id(1, 2);
        data.set_pattern_id(2, 0);
        data.allocate_channels();
        data.allocate_patterns();
        assert_eq!(data.num_patterns(), 3);

        data.set_row(3, 1, 63, 9);
        assert_eq!(*data.row(3, 1, 63), 9);
        // Orders 0 and 2 share pattern 0
        data.set_row(0, 0, 0, 5);
        assert_eq!(*data.row(0, 2, 0), 5);
    }
}
