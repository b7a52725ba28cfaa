//! Chunk-to-record decoder
//!
//! Accepts bytes in arbitrarily sized chunks, splits on `\n`, keeps the
//! trailing partial line until the next chunk arrives, and turns each
//! complete line into a [`Record`]. The first non-empty line is the header.

use std::sync::Arc;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// One logical row: column name -> value, in source column order
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    headers: Arc<[String]>,
    values: Vec<String>,
}

impl Record {
    pub fn new(headers: Arc<[String]>, mut values: Vec<String>) -> Self {
        values.resize(headers.len(), String::new());
        Record { headers, values }
    }

    /// Build a record from (column, value) pairs
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        let headers: Arc<[String]> = pairs.iter().map(|(k, _)| k.to_string()).collect();
        let values = pairs.iter().map(|(_, v)| v.to_string()).collect();
        Record { headers, values }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.headers
            .iter()
            .position(|h| h == column)
            .and_then(|idx| self.values.get(idx))
            .map(|s| s.as_str())
    }

    /// Trimmed, non-empty value of a column
    pub fn value(&self, column: &str) -> Option<&str> {
        self.get(column).map(str::trim).filter(|s| !s.is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|h| h.as_str()).zip(self.values.iter().map(|v| v.as_str()))
    }
}

pub struct RecordDecoder {
    delimiter: u8,
    pending: Vec<u8>,
    headers: Option<Arc<[String]>>,
    lines_seen: u64,
    /// Lines that could not be split into fields, or that carried more
    /// fields than the header (the extras are dropped)
    malformed: u64,
}

impl RecordDecoder {
    pub fn new(delimiter: u8) -> Self {
        Self {
            delimiter,
            pending: Vec::new(),
            headers: None,
            lines_seen: 0,
            malformed: 0,
        }
    }

    pub fn headers(&self) -> Option<&[String]> {
        self.headers.as_deref()
    }

    pub fn malformed_lines(&self) -> u64 {
        self.malformed
    }

    /// Feed a chunk and return every record it completes
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Record> {
        let scan_from = self.pending.len();
        self.pending.extend_from_slice(bytes);

        let mut records = Vec::new();
        let mut line_start = 0;
        let mut search_from = scan_from;
        while let Some(pos) = self.pending[search_from..].iter().position(|b| *b == b'\n') {
            let end = search_from + pos;
            let line = self.pending[line_start..end].to_vec();
            if let Some(record) = self.decode_line(&line) {
                records.push(record);
            }
            line_start = end + 1;
            search_from = line_start;
        }
        self.pending.drain(..line_start);
        records
    }

    /// Flush a final line that had no terminator
    pub fn finish(&mut self) -> Vec<Record> {
        let rest = std::mem::take(&mut self.pending);
        self.decode_line(&rest).into_iter().collect()
    }

    fn decode_line(&mut self, raw: &[u8]) -> Option<Record> {
        let mut raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        if self.lines_seen == 0 {
            raw = raw.strip_prefix(UTF8_BOM).unwrap_or(raw);
        }
        self.lines_seen += 1;

        let text = String::from_utf8_lossy(raw);
        if text.trim().is_empty() {
            return None;
        }

        let fields = match self.split_fields(&text) {
            Some(fields) => fields,
            None => {
                self.malformed += 1;
                tracing::warn!(line = self.lines_seen, "[Source] Skipping malformed line");
                return None;
            }
        };

        if self.headers.is_none() {
            let headers: Arc<[String]> = fields.into_iter().map(|h| h.trim().to_string()).collect();
            self.headers = Some(headers);
            return None;
        }
        let headers = self.headers.clone()?;
        if fields.len() > headers.len() {
            self.malformed += 1;
            tracing::warn!(
                line = self.lines_seen,
                fields = fields.len(),
                columns = headers.len(),
                "[Source] Extra fields dropped"
            );
        }
        Some(Record::new(headers, fields))
    }

    fn split_fields(&self, line: &str) -> Option<Vec<String>> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(self.delimiter)
            .from_reader(line.as_bytes());
        let mut row = csv::StringRecord::new();
        match reader.read_record(&mut row) {
            Ok(true) => Some(row.iter().map(|f| f.to_string()).collect()),
            Ok(false) => Some(Vec::new()),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_then_rows() {
        let mut decoder = RecordDecoder::new(b'\t');
        let records = decoder.feed(b"kingdom\tgenus\nAnimalia\tFelis\nPlantae\tRosa\n");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("kingdom"), Some("Animalia"));
        assert_eq!(records[1].get("genus"), Some("Rosa"));
        assert_eq!(decoder.headers().unwrap(), &["kingdom".to_string(), "genus".to_string()]);
    }

    #[test]
    fn test_partial_lines_across_chunks() {
        let mut decoder = RecordDecoder::new(b',');
        assert!(decoder.feed(b"kingdom,ge").is_empty());
        assert!(decoder.feed(b"nus\nAnim").is_empty());
        let records = decoder.feed(b"alia,Felis\r\nPlan");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("genus"), Some("Felis"));

        // Last line without terminator is delivered by finish()
        assert!(decoder.feed(b"tae,Rosa").is_empty());
        let rest = decoder.finish();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].get("kingdom"), Some("Plantae"));
    }

    #[test]
    fn test_bom_and_invalid_bytes() {
        let mut decoder = RecordDecoder::new(b'\t');
        let mut data = Vec::new();
        data.extend_from_slice(UTF8_BOM);
        data.extend_from_slice(b"genus\nFe\xFFlis\n");
        let records = decoder.feed(&data);
        assert_eq!(decoder.headers().unwrap()[0], "genus");
        assert_eq!(records[0].get("genus"), Some("Fe\u{FFFD}lis"));
    }

    #[test]
    fn test_multibyte_char_split_between_chunks() {
        let mut decoder = RecordDecoder::new(b'\t');
        let text = "genus\nCæsalpinia\n".as_bytes();
        // 'æ' is two bytes; split in the middle of it
        let split = text.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut records = decoder.feed(&text[..split]);
        records.extend(decoder.feed(&text[split..]));
        assert_eq!(records[0].get("genus"), Some("Cæsalpinia"));
    }

    #[test]
    fn test_short_rows_padded_and_quoted_fields() {
        let mut decoder = RecordDecoder::new(b',');
        let records = decoder.feed(b"kingdom,genus,author\n\"Animalia\",\"Felis, L.\"\n");
        assert_eq!(records[0].get("genus"), Some("Felis, L."));
        assert_eq!(records[0].get("author"), Some(""));
        assert_eq!(records[0].value("author"), None);
    }

    #[test]
    fn test_extra_fields_counted_as_malformed() {
        let mut decoder = RecordDecoder::new(b'\t');
        let records = decoder.feed(b"kingdom\tgenus\nAnimalia\tFelis\tL.\nPlantae\tRosa\n");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("genus"), Some("Felis"));
        assert_eq!(records[0].iter().count(), 2);
        assert_eq!(decoder.malformed_lines(), 1);
    }

    #[test]
    fn test_blank_lines_ignored() {
        let mut decoder = RecordDecoder::new(b'\t');
        let records = decoder.feed(b"genus\n\n  \nFelis\n\n");
        assert_eq!(records.len(), 1);
        assert!(decoder.finish().is_empty());
    }
}
