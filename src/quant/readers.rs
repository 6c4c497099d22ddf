use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::str;

use log::info;
use rust_htslib::bam::{self, record::Aux, Read as BamRead};

use crate::quant::{QuantError, Result};

/// One reference sequence, indexed by its sequence-space id.
#[derive(Debug, Clone)]
pub struct Reference {
    pub name: String,
    pub len: usize,
}

/// One candidate placement of a read on a reference.
#[derive(Debug, Clone)]
pub struct MappingHit {
    pub target_id: usize,
    pub position: i64,
    pub score: f64,
    pub concordant: bool,
}

/// One read (or read pair) with its candidate hit list. Consumed one at a
/// time, never retained.
#[derive(Debug, Clone)]
pub struct MappingRecord {
    pub read_len: u64,
    pub hits: Vec<MappingHit>,
}

/// The one capability the load phase needs from a mapping stream: produce
/// the next read's candidate-hit list. The reference table fills in as the
/// stream is consumed and is complete once `next_record` returns `None`;
/// every `target_id` handed out so far is a valid index into it.
pub trait MappingSource {
    fn next_record(&mut self) -> Result<Option<MappingRecord>>;
    fn references(&self) -> &[Reference];
    fn is_paired(&self) -> bool;
}

// ---------------------------------------------------------------------------
// native mapper dump

struct TokenReader<R> {
    reader: R,
    line: String,
    pos: usize,
}

impl<R: BufRead> TokenReader<R> {
    fn new(reader: R) -> TokenReader<R> {
        TokenReader { reader, line: String::new(), pos: 0 }
    }

    fn next_token(&mut self) -> Result<Option<String>> {
        loop {
            let bytes = self.line.as_bytes();
            while self.pos < bytes.len() && bytes[self.pos].is_ascii_whitespace() {
                self.pos += 1;
            }
            if self.pos >= bytes.len() {
                self.line.clear();
                self.pos = 0;
                if self.reader.read_line(&mut self.line)? == 0 {
                    return Ok(None);
                }
                continue;
            }
            let start = self.pos;
            while self.pos < bytes.len() && !bytes[self.pos].is_ascii_whitespace() {
                self.pos += 1;
            }
            return Ok(Some(self.line[start..self.pos].to_string()));
        }
    }

    /// Next token parsed as `T`; missing or unparsable tokens are a
    /// malformed record, reported with the read id being parsed.
    fn parse_field<T: str::FromStr>(&mut self, read_id: &str) -> Result<T> {
        match self.next_token()? {
            Some(tok) => tok
                .parse()
                .map_err(|_| QuantError::MalformedRecord(read_id.to_string())),
            None => Err(QuantError::MalformedRecord(read_id.to_string())),
        }
    }
}

/// Reader for the mapper's native dump format.
///
/// The stream opens with a `# LT:S` (single-end) or `# LT:P` (paired)
/// header; anything else is fatal. Each record is `read_id mapping_cnt`,
/// and for mapped reads the read length(s) followed by one hit per target:
/// `target_id target_name target_len`, the interval count(s), and
/// `begin length` pairs per end. The hit score is the total span of the
/// merged intervals.
pub struct PuffReader<R> {
    toks: TokenReader<R>,
    paired: bool,
    references: Vec<Reference>,
    name2id: HashMap<String, usize>,
}

impl PuffReader<BufReader<File>> {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!("mapping output file: {}", path.as_ref().display());
        PuffReader::new(BufReader::new(File::open(path)?))
    }
}

impl<R: BufRead> PuffReader<R> {
    pub fn new(reader: R) -> Result<Self> {
        let mut toks = TokenReader::new(reader);
        let hash = toks.next_token()?;
        let layout = toks.next_token()?;
        let paired = match (hash.as_deref(), layout.as_deref()) {
            (Some("#"), Some("LT:S")) => false,
            (Some("#"), Some("LT:P")) => true,
            _ => return Err(QuantError::InvalidHeader),
        };
        Ok(PuffReader {
            toks,
            paired,
            references: Vec::new(),
            name2id: HashMap::new(),
        })
    }

    fn intern(&mut self, name: &str, len: usize) -> usize {
        match self.name2id.get(name) {
            Some(&id) => id,
            None => {
                let id = self.references.len();
                self.references.push(Reference { name: name.to_string(), len });
                self.name2id.insert(name.to_string(), id);
                id
            }
        }
    }

    fn read_intervals(&mut self, rid: &str, cnt: usize, out: &mut Vec<(u64, u64)>) -> Result<()> {
        for _ in 0..cnt {
            let begin: u64 = self.toks.parse_field(rid)?;
            let len: u64 = self.toks.parse_field(rid)?;
            out.push((begin, begin + len));
        }
        Ok(())
    }
}

/// Total length spanned after sorting and merging overlapping intervals.
fn merged_span(intervals: &mut Vec<(u64, u64)>) -> u64 {
    if intervals.is_empty() {
        return 0;
    }
    intervals.sort_unstable();
    let (mut cur_begin, mut cur_end) = intervals[0];
    let mut total = 0;
    for &(begin, end) in intervals.iter().skip(1) {
        if begin <= cur_end {
            if end > cur_end {
                cur_end = end;
            }
        } else {
            total += cur_end - cur_begin;
            cur_begin = begin;
            cur_end = end;
        }
    }
    total + (cur_end - cur_begin)
}

impl<R: BufRead> MappingSource for PuffReader<R> {
    fn next_record(&mut self) -> Result<Option<MappingRecord>> {
        let rid = match self.toks.next_token()? {
            Some(t) => t,
            None => return Ok(None),
        };
        let mcnt: usize = self.toks.parse_field(&rid)?;
        if mcnt == 0 {
            return Ok(Some(MappingRecord { read_len: 0, hits: Vec::new() }));
        }
        let read_len: u64 = if self.paired {
            let left: u64 = self.toks.parse_field(&rid)?;
            let right: u64 = self.toks.parse_field(&rid)?;
            left + right
        } else {
            self.toks.parse_field(&rid)?
        };
        let mut hits = Vec::with_capacity(mcnt);
        let mut left = Vec::new();
        let mut right = Vec::new();
        for _ in 0..mcnt {
            let _mapper_tid: u64 = self.toks.parse_field(&rid)?;
            let tname: String = self.toks.parse_field(&rid)?;
            let tlen: usize = self.toks.parse_field(&rid)?;
            let left_cnt: usize = self.toks.parse_field(&rid)?;
            let right_cnt: usize = if self.paired { self.toks.parse_field(&rid)? } else { 0 };
            left.clear();
            right.clear();
            self.read_intervals(&rid, left_cnt, &mut left)?;
            self.read_intervals(&rid, right_cnt, &mut right)?;
            let score = merged_span(&mut left) + merged_span(&mut right);
            let position = left
                .first()
                .or_else(|| right.first())
                .map(|&(begin, _)| begin as i64)
                .unwrap_or(0);
            let concordant = if self.paired { left_cnt > 0 && right_cnt > 0 } else { true };
            let target_id = self.intern(&tname, tlen);
            hits.push(MappingHit { target_id, position, score: score as f64, concordant });
        }
        Ok(Some(MappingRecord { read_len, hits }))
    }

    fn references(&self) -> &[Reference] {
        &self.references
    }

    fn is_paired(&self) -> bool {
        self.paired
    }
}

// ---------------------------------------------------------------------------
// SAM/BAM variant

/// Reader for SAM-like mapper output. References come from the header,
/// consecutive records sharing a query name form one read, and the hit
/// score is the aligner's `AS` tag (missing or non-positive scores count
/// as 1 so a mapped hit is never weightless).
pub struct SamReader {
    inner: bam::Reader,
    references: Vec<Reference>,
    pending: Option<(String, MappingRecord)>,
    paired: bool,
    done: bool,
}

impl SamReader {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<SamReader> {
        info!("mapping output file: {}", path.as_ref().display());
        let inner = bam::Reader::from_path(path)?;
        let header = inner.header();
        let mut references = Vec::with_capacity(header.target_count() as usize);
        for tid in 0..header.target_count() {
            let name = str::from_utf8(header.tid2name(tid))
                .unwrap_or_default()
                .to_string();
            let len = header.target_len(tid).unwrap_or(0) as usize;
            references.push(Reference { name, len });
        }
        info!("{} references in the alignment header", references.len());
        Ok(SamReader {
            inner,
            references,
            pending: None,
            paired: false,
            done: false,
        })
    }

    fn next_alignment(&mut self) -> Result<Option<(String, MappingRecord)>> {
        let mut rec = bam::Record::new();
        match self.inner.read(&mut rec) {
            None => {
                self.done = true;
                Ok(None)
            }
            Some(res) => {
                res?;
                if rec.is_paired() {
                    self.paired = true;
                }
                let name = str::from_utf8(rec.qname()).unwrap_or_default().to_string();
                let mut record = MappingRecord {
                    read_len: rec.seq_len() as u64,
                    hits: Vec::new(),
                };
                if let Some(hit) = hit_from(&rec) {
                    record.hits.push(hit);
                }
                Ok(Some((name, record)))
            }
        }
    }
}

fn hit_from(rec: &bam::Record) -> Option<MappingHit> {
    if rec.is_unmapped() || rec.tid() < 0 {
        return None;
    }
    let score = match rec.aux(b"AS") {
        Ok(Aux::I8(v)) => v as i64,
        Ok(Aux::U8(v)) => v as i64,
        Ok(Aux::I16(v)) => v as i64,
        Ok(Aux::U16(v)) => v as i64,
        Ok(Aux::I32(v)) => v as i64,
        Ok(Aux::U32(v)) => v as i64,
        _ => 0,
    };
    Some(MappingHit {
        target_id: rec.tid() as usize,
        position: rec.pos(),
        score: score.max(1) as f64,
        concordant: rec.is_proper_pair(),
    })
}

impl MappingSource for SamReader {
    fn next_record(&mut self) -> Result<Option<MappingRecord>> {
        let (name, mut record) = match self.pending.take() {
            Some(p) => p,
            None => {
                if self.done {
                    return Ok(None);
                }
                match self.next_alignment()? {
                    Some(p) => p,
                    None => return Ok(None),
                }
            }
        };
        while let Some((next_name, next_record)) = self.next_alignment()? {
            if next_name == name {
                record.hits.extend(next_record.hits);
            } else {
                self.pending = Some((next_name, next_record));
                break;
            }
        }
        Ok(Some(record))
    }

    fn references(&self) -> &[Reference] {
        &self.references
    }

    fn is_paired(&self) -> bool {
        self.paired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn reader(text: &str) -> PuffReader<Cursor<Vec<u8>>> {
        PuffReader::new(Cursor::new(text.as_bytes().to_vec())).unwrap()
    }

    #[test]
    fn rejects_bad_header() {
        assert!(matches!(
            PuffReader::new(Cursor::new(b"LT:S\n".to_vec())),
            Err(QuantError::InvalidHeader)
        ));
        assert!(matches!(
            PuffReader::new(Cursor::new(b"# LT:X\n".to_vec())),
            Err(QuantError::InvalidHeader)
        ));
        assert!(matches!(
            PuffReader::new(Cursor::new(Vec::new())),
            Err(QuantError::InvalidHeader)
        ));
    }

    #[test]
    fn parses_single_end_records() {
        let text = "# LT:S\n\
                    read1 2 100 0 refA 1000 1 0 60 1 refB 2000 2 10 30 35 40\n\
                    read2 0\n\
                    read3 1 100 0 refA 1000 1 5 80\n";
        let mut r = reader(text);

        let rec1 = r.next_record().unwrap().unwrap();
        assert_eq!(rec1.read_len, 100);
        assert_eq!(rec1.hits.len(), 2);
        assert_eq!(rec1.hits[0].target_id, 0);
        assert_eq!(rec1.hits[0].score, 60.0);
        assert_eq!(rec1.hits[0].position, 0);
        // intervals [10,40) and [35,75) merge into [10,75)
        assert_eq!(rec1.hits[1].target_id, 1);
        assert_eq!(rec1.hits[1].score, 65.0);
        assert_eq!(rec1.hits[1].position, 10);

        let rec2 = r.next_record().unwrap().unwrap();
        assert!(rec2.hits.is_empty());

        let rec3 = r.next_record().unwrap().unwrap();
        assert_eq!(rec3.hits[0].target_id, 0); // refA interned once
        assert!(r.next_record().unwrap().is_none());

        assert_eq!(r.references().len(), 2);
        assert_eq!(r.references()[0].name, "refA");
        assert_eq!(r.references()[1].len, 2000);
    }

    #[test]
    fn paired_records_sum_lengths_and_flag_concordance() {
        let text = "# LT:P\n\
                    read1 2 75 75 0 refA 1000 1 1 0 70 700 70 1 refB 500 1 0 20 50\n";
        let mut r = reader(text);
        assert!(r.is_paired());
        let rec = r.next_record().unwrap().unwrap();
        assert_eq!(rec.read_len, 150);
        assert_eq!(rec.hits.len(), 2);
        assert!(rec.hits[0].concordant);
        assert_eq!(rec.hits[0].score, 140.0);
        // right end never mapped
        assert!(!rec.hits[1].concordant);
        assert_eq!(rec.hits[1].score, 50.0);
    }

    #[test]
    fn truncated_record_is_malformed() {
        let mut r = reader("# LT:S\nread1 1 100 0 refA\n");
        assert!(matches!(
            r.next_record(),
            Err(QuantError::MalformedRecord(_))
        ));
    }

    #[test]
    fn merged_span_handles_overlap_and_disjoint() {
        let mut iv = vec![(10, 40), (35, 75)];
        assert_eq!(merged_span(&mut iv), 65);
        let mut iv = vec![(0, 10), (20, 30)];
        assert_eq!(merged_span(&mut iv), 20);
        let mut iv = Vec::new();
        assert_eq!(merged_span(&mut iv), 0);
    }
}
