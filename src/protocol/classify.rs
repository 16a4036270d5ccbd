use super::RECORD_WIRE_SIZE;
use crate::model::{AckKind, BlockId, Event, MemoryReport, StatusKind};

const WAIT_ACK_PREFIX: &str = "WAIT_ACK:";
const END_MARKER: &str = "END";
const FREE_TEXT_PREFIX: &str = "ESP32 libre:";
const FREE_HEAP_PREFIX: &str = "FREE_HEAP:";
const ACK_PREFIX: &str = "ACK:";

// Firmware builds report status in Spanish or English.
const STATUS_PREFIXES: &[(&str, StatusKind)] = &[
    ("Buscando", StatusKind::Searching),
    ("Searching", StatusKind::Searching),
    ("Intentando", StatusKind::Connecting),
    ("Connecting", StatusKind::Connecting),
    ("Conectado", StatusKind::Connected),
    ("Connected", StatusKind::Connected),
    ("Error", StatusKind::Error),
    ("No se encontró", StatusKind::NotFound),
    ("Not found", StatusKind::NotFound),
    ("DBG:", StatusKind::Debug),
    ("DEBUG", StatusKind::Debug),
];

#[derive(Debug, Clone, Copy)]
pub struct ClassifyContext {
    /// A FETCH transfer is in progress, so data lines are expected.
    pub streaming: bool,
    pub record_size: u64,
}

impl Default for ClassifyContext {
    fn default() -> Self {
        Self {
            streaming: false,
            record_size: RECORD_WIRE_SIZE,
        }
    }
}

type Rule = fn(&str, &ClassifyContext) -> Option<Event>;

// Evaluated top to bottom; the first match wins.
const RULES: &[Rule] = &[
    block_wait,
    end_of_stream,
    memory_report,
    acknowledgment,
    device_status,
    data_record,
];

/// Classifies one decoded line. Never fails: unmatched input comes back as
/// an `Unclassified` status carrying the raw text.
pub fn classify(line: &str, ctx: &ClassifyContext) -> Event {
    let line = line.trim();
    RULES
        .iter()
        .find_map(|rule| rule(line, ctx))
        .unwrap_or_else(|| Event::status(StatusKind::Unclassified, line))
}

// Any id text is accepted; the device blocks until it sees it echoed back.
fn block_wait(line: &str, _ctx: &ClassifyContext) -> Option<Event> {
    let id = line.strip_prefix(WAIT_ACK_PREFIX)?.trim();
    Some(Event::BlockWait {
        block: BlockId::new(id),
    })
}

fn end_of_stream(line: &str, _ctx: &ClassifyContext) -> Option<Event> {
    (line == END_MARKER).then_some(Event::EndOfStream)
}

fn memory_report(line: &str, ctx: &ClassifyContext) -> Option<Event> {
    if line.starts_with(FREE_TEXT_PREFIX) {
        return Some(Event::MemoryReport(MemoryReport {
            raw: line.to_string(),
            free_bytes: None,
            samples_that_fit: None,
        }));
    }
    let free_bytes: u64 = line.strip_prefix(FREE_HEAP_PREFIX)?.trim().parse().ok()?;
    Some(Event::MemoryReport(MemoryReport {
        raw: line.to_string(),
        free_bytes: Some(free_bytes),
        samples_that_fit: free_bytes.checked_div(ctx.record_size),
    }))
}

fn acknowledgment(line: &str, _ctx: &ClassifyContext) -> Option<Event> {
    let kind = line.strip_prefix(ACK_PREFIX)?;
    Some(Event::Ack {
        kind: AckKind::parse(kind),
    })
}

fn device_status(line: &str, _ctx: &ClassifyContext) -> Option<Event> {
    STATUS_PREFIXES
        .iter()
        .find(|(prefix, _)| line.starts_with(prefix))
        .map(|(_, kind)| Event::status(*kind, line))
}

fn data_record(line: &str, ctx: &ClassifyContext) -> Option<Event> {
    if !ctx.streaming {
        return None;
    }
    match parse_record(line) {
        Ok(fields) => Some(Event::DataRecord { fields }),
        Err(RecordRejected::FieldCount(_)) => None,
        Err(RecordRejected::BadField(_)) => {
            Some(Event::status(StatusKind::MalformedRecord, line))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordRejected {
    /// Not shaped like a record at all.
    FieldCount(usize),
    /// Record-shaped, but the field at this index failed to parse.
    BadField(usize),
}

/// Splits a data line into `timestamp,side,top,bottom`.
///
/// The 5-field form `side_channel,timestamp,side,top,bottom` has its leading
/// index dropped. Whitespace around a field is tolerated when validating,
/// but fields are returned verbatim.
pub fn parse_record(line: &str) -> Result<Vec<String>, RecordRejected> {
    let parts: Vec<&str> = line.split(',').collect();
    let fields = match parts.len() {
        4 => &parts[..],
        5 => &parts[1..],
        n => return Err(RecordRejected::FieldCount(n)),
    };
    let offset = parts.len() - fields.len();

    match fields[0].trim().parse::<f64>() {
        Ok(ts) if ts.is_finite() => {}
        _ => return Err(RecordRejected::BadField(offset)),
    }
    for (i, field) in fields.iter().enumerate().skip(1) {
        if field.trim().parse::<i64>().is_err() {
            return Err(RecordRejected::BadField(offset + i));
        }
    }

    Ok(fields.iter().map(|f| f.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn streaming() -> ClassifyContext {
        ClassifyContext {
            streaming: true,
            ..Default::default()
        }
    }

    fn idle() -> ClassifyContext {
        ClassifyContext::default()
    }

    #[test]
    fn wait_ack_yields_block_wait() {
        assert_eq!(
            classify("WAIT_ACK:7", &idle()),
            Event::BlockWait {
                block: BlockId::new("7")
            }
        );
        assert_eq!(
            classify("  WAIT_ACK:12\r\n", &streaming()),
            Event::BlockWait {
                block: BlockId::new("12")
            }
        );
    }

    #[test]
    fn block_id_text_is_echoed_verbatim() {
        let cases = [
            ("WAIT_ACK:abc", "ACK:BLOCK_abc"),
            ("WAIT_ACK:007", "ACK:BLOCK_007"),
            ("WAIT_ACK:-1", "ACK:BLOCK_-1"),
            ("WAIT_ACK:4294967296", "ACK:BLOCK_4294967296"),
        ];
        for (line, ack) in cases {
            match classify(line, &streaming()) {
                Event::BlockWait { block } => {
                    assert_eq!(crate::protocol::Command::AckBlock(block).encode(), ack)
                }
                other => panic!("{line} classified as {other:?}"),
            }
        }
    }

    #[test]
    fn end_marker_must_match_exactly() {
        assert_eq!(classify("END", &streaming()), Event::EndOfStream);
        assert_eq!(
            classify("ENDING", &idle()),
            Event::status(StatusKind::Unclassified, "ENDING")
        );
    }

    #[test]
    fn free_heap_derives_sample_capacity() {
        match classify("FREE_HEAP:1220", &idle()) {
            Event::MemoryReport(report) => {
                assert_eq!(report.free_bytes, Some(1220));
                assert_eq!(report.samples_that_fit, Some(45));
            }
            other => panic!("expected memory report, got {other:?}"),
        }
    }

    #[test]
    fn human_memory_report_has_no_derived_count() {
        match classify("ESP32 libre: 180 KB", &idle()) {
            Event::MemoryReport(report) => {
                assert_eq!(report.raw, "ESP32 libre: 180 KB");
                assert_eq!(report.free_bytes, None);
                assert_eq!(report.samples_that_fit, None);
            }
            other => panic!("expected memory report, got {other:?}"),
        }
    }

    #[test]
    fn zero_record_size_does_not_panic() {
        let ctx = ClassifyContext {
            streaming: false,
            record_size: 0,
        };
        match classify("FREE_HEAP:100", &ctx) {
            Event::MemoryReport(report) => assert_eq!(report.samples_that_fit, None),
            other => panic!("expected memory report, got {other:?}"),
        }
    }

    #[test]
    fn ack_lines_carry_their_kind() {
        assert_eq!(
            classify("ACK:SYNC", &idle()),
            Event::Ack {
                kind: AckKind::Sync
            }
        );
        assert_eq!(
            classify("ACK:WHATEVER", &idle()),
            Event::Ack {
                kind: AckKind::Other("WHATEVER".to_string())
            }
        );
    }

    #[test]
    fn status_prefixes_map_to_kinds() {
        let cases = [
            ("Buscando ESP32...", StatusKind::Searching),
            ("Intentando conectar", StatusKind::Connecting),
            ("Conectado al ESP32", StatusKind::Connected),
            ("Error BLE: boom", StatusKind::Error),
            ("No se encontró ESP32 por dirección", StatusKind::NotFound),
            ("DBG: buffer flushed", StatusKind::Debug),
        ];
        for (line, kind) in cases {
            assert_eq!(classify(line, &streaming()), Event::status(kind, line));
        }
    }

    #[test]
    fn four_field_record_is_kept_verbatim() {
        assert_eq!(
            classify("1747410717.502,122,397,260", &streaming()),
            Event::DataRecord {
                fields: vec![
                    "1747410717.502".to_string(),
                    "122".to_string(),
                    "397".to_string(),
                    "260".to_string(),
                ]
            }
        );
    }

    #[test]
    fn five_field_record_drops_side_channel_index() {
        assert_eq!(
            classify("X,1747410717.502,122,397,260", &streaming()),
            Event::DataRecord {
                fields: vec![
                    "1747410717.502".to_string(),
                    "122".to_string(),
                    "397".to_string(),
                    "260".to_string(),
                ]
            }
        );
    }

    #[test]
    fn padded_record_fields_are_accepted_verbatim() {
        assert_eq!(
            classify("1747410717.502, 122, 397, 260", &streaming()),
            Event::DataRecord {
                fields: vec![
                    "1747410717.502".to_string(),
                    " 122".to_string(),
                    " 397".to_string(),
                    " 260".to_string(),
                ]
            }
        );
        assert_eq!(
            parse_record("X, 1747410717.5 ,1,2,3"),
            Ok(vec![
                " 1747410717.5 ".to_string(),
                "1".to_string(),
                "2".to_string(),
                "3".to_string(),
            ])
        );
    }

    #[test]
    fn records_outside_a_transfer_are_not_data() {
        assert_eq!(
            classify("1747410717.502,122,397,260", &idle()),
            Event::status(StatusKind::Unclassified, "1747410717.502,122,397,260")
        );
    }

    #[test]
    fn garbled_records_are_marked_malformed() {
        assert_eq!(
            classify("1747410717.502,12x,397,260", &streaming()),
            Event::status(StatusKind::MalformedRecord, "1747410717.502,12x,397,260")
        );
        assert_eq!(
            classify("nan,1,2,3", &streaming()),
            Event::status(StatusKind::MalformedRecord, "nan,1,2,3")
        );
        assert_eq!(
            classify("a,b", &streaming()),
            Event::status(StatusKind::Unclassified, "a,b")
        );
    }

    #[test]
    fn parse_record_reports_offending_field() {
        assert_eq!(parse_record("1.0,1,2"), Err(RecordRejected::FieldCount(3)));
        assert_eq!(parse_record("x,1.0,1,2,y"), Err(RecordRejected::BadField(4)));
        assert_eq!(parse_record("1.0,1,,2"), Err(RecordRejected::BadField(2)));
    }

    #[test]
    fn classification_is_total_over_odd_input() {
        let lines = [
            "",
            "   ",
            "ACK:",
            "WAIT_ACK:",
            "FREE_HEAP:lots",
            "ESP32 libre:",
            ",,,",
            ",,,,",
            "\u{fffd}\u{fffd}",
            "1,2,3,4,5,6",
        ];
        for line in lines {
            for ctx in [idle(), streaming()] {
                // Every line lands in exactly one variant; a panic or a
                // missing arm would fail here.
                let _ = classify(line, &ctx);
            }
        }
        assert_eq!(
            classify("FREE_HEAP:lots", &idle()),
            Event::status(StatusKind::Unclassified, "FREE_HEAP:lots")
        );
    }
}
