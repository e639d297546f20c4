use crate::scheduling::FetchOutcome;

/// Counters for one crawl pass, or a running total across passes.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ScoutStats {
    pub venues_crawled: u32,
    pub fetch_success: u32,
    pub rate_limited: u32,
    pub structural_blocks: u32,
    pub network_errors: u32,
    pub media_fetched: u32,
    pub media_duplicates: u32,
    pub classified: u32,
    pub cache_hits: u32,
    pub classification_dropped: u32,
    pub classification_calls: u32,
    pub scores_forwarded: u32,
    pub alerts_raised: u32,
    pub cache_corruptions: u32,
}

impl ScoutStats {
    pub fn record_outcome(&mut self, outcome: &FetchOutcome) {
        self.venues_crawled += 1;
        match outcome {
            FetchOutcome::Success => self.fetch_success += 1,
            FetchOutcome::RateLimited => self.rate_limited += 1,
            FetchOutcome::StructuralBlock { .. } => self.structural_blocks += 1,
            FetchOutcome::NetworkError { .. } => self.network_errors += 1,
        }
    }

    /// Add another pass's counters into this one.
    pub fn absorb(&mut self, other: &ScoutStats) {
        self.venues_crawled += other.venues_crawled;
        self.fetch_success += other.fetch_success;
        self.rate_limited += other.rate_limited;
        self.structural_blocks += other.structural_blocks;
        self.network_errors += other.network_errors;
        self.media_fetched += other.media_fetched;
        self.media_duplicates += other.media_duplicates;
        self.classified += other.classified;
        self.cache_hits += other.cache_hits;
        self.classification_dropped += other.classification_dropped;
        self.classification_calls += other.classification_calls;
        self.scores_forwarded += other.scores_forwarded;
        self.alerts_raised += other.alerts_raised;
        self.cache_corruptions += other.cache_corruptions;
    }
}

impl std::fmt::Display for ScoutStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n=== Vibe Scout Pass ===")?;
        writeln!(f, "Venues crawled:     {}", self.venues_crawled)?;
        writeln!(f, "  Success:          {}", self.fetch_success)?;
        writeln!(f, "  Rate limited:     {}", self.rate_limited)?;
        writeln!(f, "  Structural block: {}", self.structural_blocks)?;
        writeln!(f, "  Network error:    {}", self.network_errors)?;
        writeln!(f, "Media fetched:      {}", self.media_fetched)?;
        writeln!(f, "Media duplicates:   {}", self.media_duplicates)?;
        writeln!(f, "\nClassification:")?;
        writeln!(f, "  Classified:       {}", self.classified)?;
        let total = (self.classified + self.classification_dropped).max(1);
        writeln!(
            f,
            "  Cache hits:       {} ({:.0}%)",
            self.cache_hits,
            self.cache_hits as f64 / total as f64 * 100.0
        )?;
        writeln!(f, "  Dropped:          {}", self.classification_dropped)?;
        writeln!(f, "  Calls:            {}", self.classification_calls)?;
        writeln!(f, "\nScores forwarded:   {}", self.scores_forwarded)?;
        writeln!(f, "Operator alerts:    {}", self.alerts_raised)?;
        if self.cache_corruptions > 0 {
            writeln!(f, "Cache corruptions:  {}", self.cache_corruptions)?;
        }
        Ok(())
    }
}
