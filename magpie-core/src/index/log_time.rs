//! Timestamp extraction from robot log files.
//!
//! Log lines come in a handful of layouts, frequently without a date or a
//! year. A *hint* datetime recovered from the filename (or the first line)
//! supplies the missing pieces. All wall-clock text is interpreted in fixed
//! UTC+08:00, the timezone the fleets run in.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::LazyLock;

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc,
};
use regex::Regex;

use crate::error::Result;

pub const CHUNK_SIZE: usize = 16 * 1024;
const BUFFER_SIZE: usize = 512;
const ATTEMPT_LIMIT: u64 = 5;
const TRANSCODE_CHUNK_SIZE: usize = 1024 * 1024;

fn tz() -> FixedOffset {
    FixedOffset::east_opt(8 * 3600).expect("UTC+08:00 is a valid offset")
}

fn now_local() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&tz())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEncoding {
    Utf8,
    Gb2312,
}

/// Sniff the first 16 KiB: invalid UTF-8 that decodes cleanly as GBK is
/// treated as GB2312; everything else as UTF-8.
pub fn detect_file_encoding(path: &Path) -> Result<FileEncoding> {
    let mut file = File::open(path)?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let n = file.read(&mut buf)?;
    buf.truncate(n);

    if std::str::from_utf8(&buf).is_ok() {
        return Ok(FileEncoding::Utf8);
    }
    let (_, _, had_errors) = encoding_rs::GBK.decode(&buf);
    if !had_errors {
        Ok(FileEncoding::Gb2312)
    } else {
        Ok(FileEncoding::Utf8)
    }
}

fn decode_bytes(bytes: &[u8], encoding: FileEncoding) -> String {
    match encoding {
        FileEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        FileEncoding::Gb2312 => encoding_rs::GBK.decode(bytes).0.into_owned(),
    }
}

static HINT_PATTERNS: LazyLock<[(Regex, HintKind); 3]> = LazyLock::new(|| {
    [
        (
            Regex::new(r"\d{4}-\d{2}-\d{2}\s+\d{2}:\d{2}:\d{2}").unwrap(),
            HintKind::DashedDateTime,
        ),
        (
            Regex::new(r"\d{4}/\d{2}/\d{2}\s+\d{2}:\d{2}:\d{2}").unwrap(),
            HintKind::SlashedDateTime,
        ),
        (Regex::new(r"\d{10}").unwrap(), HintKind::CompactDateHour),
    ]
});

#[derive(Debug, Clone, Copy)]
enum HintKind {
    DashedDateTime,
    SlashedDateTime,
    CompactDateHour,
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn parse_hint(text: &str) -> Option<DateTime<FixedOffset>> {
    for (regex, kind) in HINT_PATTERNS.iter() {
        let Some(found) = regex.find(text) else {
            continue;
        };
        let raw = collapse_whitespace(found.as_str());
        let parsed = match kind {
            HintKind::DashedDateTime => {
                NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S").ok()
            }
            HintKind::SlashedDateTime => {
                NaiveDateTime::parse_from_str(&raw, "%Y/%m/%d %H:%M:%S").ok()
            }
            HintKind::CompactDateHour => NaiveDateTime::parse_from_str(&format!("{raw}0000"), "%Y%m%d%H%M%S").ok(),
        };
        if let Some(naive) = parsed {
            if let Some(dt) = tz().from_local_datetime(&naive).single() {
                return Some(dt);
            }
        }
    }
    None
}

/// Hint from the filename first, then from the first line of the file.
pub fn timestamp_hint_for_file(
    path: &Path,
    encoding: FileEncoding,
) -> Option<DateTime<FixedOffset>> {
    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        if let Some(hint) = parse_hint(name) {
            return Some(hint);
        }
    }

    let mut file = File::open(path).ok()?;
    let mut buf = vec![0u8; BUFFER_SIZE];
    let n = file.read(&mut buf).ok()?;
    buf.truncate(n);
    let text = decode_bytes(&buf, encoding);
    parse_hint(text.lines().next().unwrap_or_default())
}

/// What a line schema managed to recover.
#[derive(Debug, Clone, Copy)]
struct PartialTimestamp {
    date: PartialDate,
    time: NaiveTime,
}

#[derive(Debug, Clone, Copy)]
enum PartialDate {
    Full(NaiveDate),
    /// Month and day known, year missing.
    MonthDay { month: u32, day: u32 },
    /// No date at all.
    None,
}

struct LineSchema {
    regex: Regex,
    parse: fn(&str) -> Option<PartialTimestamp>,
}

static LINE_SCHEMAS: LazyLock<Vec<LineSchema>> = LazyLock::new(|| {
    vec![
        // 2024-01-15 12:00:00.123
        LineSchema {
            regex: Regex::new(r"\d{4}-\d{2}-\d{2}\s+\d{2}:\d{2}:\d{2}\.\d{3}").unwrap(),
            parse: |raw| {
                let raw = collapse_whitespace(raw);
                NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S%.f")
                    .ok()
                    .map(|dt| PartialTimestamp {
                        date: PartialDate::Full(dt.date()),
                        time: dt.time(),
                    })
            },
        },
        // 2024-01-15 12:00:00,123
        LineSchema {
            regex: Regex::new(r"\d{4}-\d{2}-\d{2}\s+\d{2}:\d{2}:\d{2},\d{3}").unwrap(),
            parse: |raw| {
                let raw = collapse_whitespace(raw).replace(',', ".");
                NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S%.f")
                    .ok()
                    .map(|dt| PartialTimestamp {
                        date: PartialDate::Full(dt.date()),
                        time: dt.time(),
                    })
            },
        },
        // glog: 0115 12:00:00.123456
        LineSchema {
            regex: Regex::new(r"\d{4}\s+\d{2}:\d{2}:\d{2}\.\d{6}").unwrap(),
            parse: |raw| {
                let raw = collapse_whitespace(raw);
                let (md, time) = raw.split_once(' ')?;
                let month: u32 = md[..2].parse().ok()?;
                let day: u32 = md[2..].parse().ok()?;
                let time = NaiveTime::parse_from_str(time, "%H:%M:%S%.f").ok()?;
                if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
                    return None;
                }
                Some(PartialTimestamp {
                    date: PartialDate::MonthDay { month, day },
                    time,
                })
            },
        },
        // syslog: Jan 15 12:00:00
        LineSchema {
            regex: Regex::new(r"[a-zA-Z]{3}\s+\d{1,2}\s+\d{2}:\d{2}:\d{2}").unwrap(),
            parse: |raw| {
                let raw = collapse_whitespace(raw);
                // borrow a leap year so Feb 29 parses; the real year comes later
                let dt =
                    NaiveDateTime::parse_from_str(&format!("2000 {raw}"), "%Y %b %d %H:%M:%S")
                        .ok()?;
                Some(PartialTimestamp {
                    date: PartialDate::MonthDay {
                        month: dt.month(),
                        day: dt.day(),
                    },
                    time: dt.time(),
                })
            },
        },
        // bare time: 12:00:00.123
        LineSchema {
            regex: Regex::new(r"\d{2}:\d{2}:\d{2}\.\d{3}").unwrap(),
            parse: |raw| {
                NaiveTime::parse_from_str(raw, "%H:%M:%S%.f")
                    .ok()
                    .map(|time| PartialTimestamp {
                        date: PartialDate::None,
                        time,
                    })
            },
        },
    ]
});

fn resolve(partial: PartialTimestamp, hint: Option<DateTime<FixedOffset>>) -> Option<DateTime<FixedOffset>> {
    let zone = tz();
    let build = |date: NaiveDate| zone.from_local_datetime(&date.and_time(partial.time)).single();

    match partial.date {
        PartialDate::Full(date) => build(date),
        PartialDate::MonthDay { month, day } => match hint {
            Some(hint) => {
                let candidate = build(NaiveDate::from_ymd_opt(hint.year(), month, day)?)?;
                if candidate < hint {
                    build(NaiveDate::from_ymd_opt(hint.year() + 1, month, day)?)
                } else {
                    Some(candidate)
                }
            }
            None => {
                let now = now_local();
                let candidate = build(NaiveDate::from_ymd_opt(now.year(), month, day)?)?;
                if candidate > now {
                    build(NaiveDate::from_ymd_opt(now.year() - 1, month, day)?)
                } else {
                    Some(candidate)
                }
            }
        },
        PartialDate::None => match hint {
            Some(hint) => {
                let candidate = build(hint.date_naive())?;
                if candidate < hint {
                    Some(candidate + Duration::days(1))
                } else {
                    Some(candidate)
                }
            }
            None => {
                let now = now_local();
                let candidate = build(now.date_naive())?;
                if candidate > now {
                    Some(candidate - Duration::days(1))
                } else {
                    Some(candidate)
                }
            }
        },
    }
}

/// First timestamp found in `text`, schemas tried in order.
pub fn timestamp_from_line(
    text: &str,
    hint: Option<DateTime<FixedOffset>>,
) -> Option<DateTime<FixedOffset>> {
    for schema in LINE_SCHEMAS.iter() {
        if let Some(found) = schema.regex.find(text) {
            if let Some(partial) = (schema.parse)(found.as_str()) {
                if let Some(resolved) = resolve(partial, hint) {
                    return Some(resolved);
                }
            }
        }
    }
    None
}

/// Scan forward from the top of the file, one chunk at a time.
pub fn start_timestamp(path: &Path) -> Result<Option<i64>> {
    let file_size = path.metadata()?.len();
    let encoding = detect_file_encoding(path)?;
    let hint = timestamp_hint_for_file(path, encoding);
    let mut file = File::open(path)?;

    for attempt in 0..ATTEMPT_LIMIT {
        let offset = attempt * CHUNK_SIZE as u64;
        if offset >= file_size {
            break;
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; CHUNK_SIZE + BUFFER_SIZE];
        let n = file.read(&mut buf)?;
        buf.truncate(n);
        let text = decode_bytes(&buf, encoding);
        if let Some(ts) = timestamp_from_line(&text, hint) {
            return Ok(Some(ts.timestamp()));
        }
    }
    tracing::warn!(path = %path.display(), "failed to find start timestamp");
    Ok(None)
}

/// Scan backwards from the end of the file, line by line within each chunk.
pub fn end_timestamp(path: &Path) -> Result<Option<i64>> {
    let file_size = path.metadata()?.len();
    let encoding = detect_file_encoding(path)?;
    let hint = timestamp_hint_for_file(path, encoding);
    let mut file = File::open(path)?;

    for attempt in 0..ATTEMPT_LIMIT {
        let end_offset = file_size.saturating_sub(attempt * CHUNK_SIZE as u64);
        if end_offset == 0 {
            break;
        }
        let start_offset = end_offset.saturating_sub((CHUNK_SIZE + BUFFER_SIZE) as u64);
        file.seek(SeekFrom::Start(start_offset))?;
        let mut buf = vec![0u8; (end_offset - start_offset) as usize];
        let n = file.read(&mut buf)?;
        buf.truncate(n);
        let text = decode_bytes(&buf, encoding);
        for line in text.lines().rev() {
            if let Some(ts) = timestamp_from_line(line, hint) {
                return Ok(Some(ts.timestamp()));
            }
        }
    }
    tracing::warn!(path = %path.display(), "failed to find end timestamp");
    Ok(None)
}

/// Copy a log into `target_dir`, transcoding GB2312 content to UTF-8. The
/// window bounds are accepted for interface parity; slicing happens at the
/// line level only when the encodings differ.
pub fn prepare_cut(src: &Path, target_dir: &Path, _start_secs: i64, _end_secs: i64) -> Result<std::path::PathBuf> {
    let file_name = src
        .file_name()
        .ok_or_else(|| crate::error::AgentError::UnsupportedFile(src.to_path_buf()))?;
    let dst = target_dir.join(file_name);
    std::fs::create_dir_all(target_dir)?;

    match detect_file_encoding(src)? {
        FileEncoding::Utf8 => {
            std::fs::copy(src, &dst)?;
        }
        FileEncoding::Gb2312 => {
            let mut reader = File::open(src)?;
            let mut writer = std::fs::File::create(&dst)?;
            let mut decoder = encoding_rs::GBK.new_decoder();
            let mut in_buf = vec![0u8; TRANSCODE_CHUNK_SIZE];
            let mut out = String::with_capacity(TRANSCODE_CHUNK_SIZE * 2);
            loop {
                let n = reader.read(&mut in_buf)?;
                let last = n == 0;
                out.clear();
                // reserve enough for the worst case expansion
                out.reserve(
                    decoder
                        .max_utf8_buffer_length(n)
                        .unwrap_or(TRANSCODE_CHUNK_SIZE * 4),
                );
                let (_, _, _) = decoder.decode_to_string(&in_buf[..n], &mut out, last);
                use std::io::Write;
                writer.write_all(out.as_bytes())?;
                if last {
                    break;
                }
            }
        }
    }
    Ok(dst)
}
