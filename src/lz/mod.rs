//! LZ77 primitives: the decoder-side sliding window and the encoder-side
//! hash-chain match finder.

mod match_finder;
mod window;

pub use match_finder::{MAX_CHAIN, MAX_MATCH, MIN_MATCH, Match, MatchFinder, WINDOW_SIZE};
pub use window::SlidingWindow;
