use log::info;

/// Per-run read accounting. Everything here is diagnostic output, never an
/// error condition.
#[derive(Debug, Default, Clone)]
pub struct ReadStats {
    /*
    total: every read seen in the mapping stream
    multi_mapped: reads whose accepted hit list has more than one target
    unmapped: reads the mapper reported with zero hits
    not_found: reads whose every hit named a reference without a taxonomy id
    conflicting: reads that lost every hit to the concordance filter
    discordant: individual hits dropped by the concordance filter
    filtered: reads rejected by the uniqueness or perfection filter
    */
    pub total: usize,
    pub multi_mapped: usize,
    pub unmapped: usize,
    pub not_found: usize,
    pub conflicting: usize,
    pub discordant: usize,
    pub filtered: usize,
}

impl ReadStats {
    pub fn accepted(&self) -> usize {
        self.total - self.unmapped - self.not_found - self.conflicting - self.filtered
    }

    pub fn log_summary(&self) {
        info!("stats:");
        info!("# of reads: {}", self.total);
        info!("# of multi-mapped reads: {}", self.multi_mapped);
        info!("# of unmapped reads: {}", self.unmapped);
        info!("# of reads with no resolvable reference: {}", self.not_found);
        info!("# of conflicting reads: {}", self.conflicting);
        info!("# of discordant hits dropped: {}", self.discordant);
        info!("# of reads failing filters: {}", self.filtered);
        info!("# of accepted reads: {}", self.accepted());
    }
}
