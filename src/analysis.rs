pub mod summarizer;

pub use summarizer::{DisabledSummarizer, LlmSummarizer, SessionSummarizer};
