// src/nmea/mod.rs
//! NMEA-0183 sentence parsing and stream framing

pub mod reader;
pub mod sentence;

pub use reader::{RawSentence, SentenceReader};
pub use sentence::{parse_sentence, sentence_checksum, verify_checksum, Sentence, KNOTS_TO_KMH};
