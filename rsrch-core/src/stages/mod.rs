//! Pipeline stages.
//!
//! Each stage receives read-only inputs and returns new artifacts; the
//! orchestrator owns all accumulation across stages and iterations.

pub mod context;
pub mod intent;
pub mod planner;
pub mod reflector;
pub mod summarizer;
pub mod tables;
pub mod verifier;

use chrono::{DateTime, Utc};

/// Source-grounding directive prepended to summarize, report, and verify
/// prompts: the provided source text is authoritative over anything the
/// model remembers, and temporal qualifiers must come from the source.
pub(crate) fn source_grounding_block(now: DateTime<Utc>) -> String {
    let current_date = now.format("%B %d, %Y");
    format!(
        "SOURCE PRIORITIZATION RULES:\n\
         \n\
         Current date (UTC): {current_date}\n\
         \n\
         1. Trust the provided source material completely. It is more recent \
         than your training data; where they conflict, the sources are correct.\n\
         2. Never \"correct\" names, titles, positions, dates, or facts taken \
         from the sources based on what you remember.\n\
         3. Do not add temporal qualifiers such as \"former\", \"current\", or \
         \"as of\" unless they appear in the sources.\n\
         4. When in doubt, stay close to the source text and quote it.\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_grounding_block_contains_date() {
        let now = Utc.with_ymd_and_hms(2025, 7, 4, 12, 0, 0).unwrap();
        let block = source_grounding_block(now);
        assert!(block.contains("July 04, 2025"));
        assert!(block.contains("sources are correct"));
        assert!(block.contains("temporal qualifiers"));
    }
}
