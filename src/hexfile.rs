//! Intel HEX reader/writer for paged word images.
//!
//! Record-level parsing and checksum handling is delegated to the `ihex`
//! crate; this module owns the mapping between byte-addressed records and
//! the word-granular, absent-aware [`Image`] model. Serialization splits
//! each page into eight-word blocks and each block into maximal runs of
//! concrete words, so absent spans are skipped rather than zero-filled and
//! a parse of the output reproduces the image exactly.

use std::fs;
use std::path::Path;

use ihex::Record;

use crate::constants::{PAGE_BYTES, PAGE_WORDS, PAGES_PER_BLOCK};
use crate::error::{Error, Result};
use crate::memory::Image;

/// Words per data record on output.
const RECORD_WORDS: usize = 8;

pub fn parse(text: &str) -> Result<Image> {
    let mut image = Image::new();
    let mut base: u32 = 0;

    for (idx, line) in text.lines().enumerate() {
        let line_num = idx + 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let record =
            Record::from_record_string(line).map_err(|e| reader_error(line_num, e))?;

        match record {
            Record::ExtendedLinearAddress(high) => base = (high as u32) << 16,
            Record::ExtendedSegmentAddress(segment) => base = (segment as u32) * 16,
            Record::Data { offset, value } => {
                let address = base + offset as u32;
                if address % 2 != 0 || value.len() % 2 != 0 {
                    return Err(Error::Format {
                        line: line_num,
                        reason: "data record is not word aligned".into(),
                    });
                }
                for (i, pair) in value.chunks_exact(2).enumerate() {
                    let word_address = address as usize / 2 + i;
                    let (page_num, offset) = (word_address / PAGE_WORDS, word_address % PAGE_WORDS);
                    image
                        .page_entry(page_num)
                        .set_word(offset, Some(u16::from_le_bytes([pair[0], pair[1]])))?;
                }
            }
            Record::EndOfFile => break,
            Record::StartSegmentAddress { .. } | Record::StartLinearAddress(_) => {}
        }
    }

    Ok(image)
}

pub fn serialize(image: &Image) -> Result<String> {
    let mut out = String::new();
    // Forces an extended address record before the first page.
    let mut block = usize::MAX;

    for page_num in 0..image.len() {
        if page_num / PAGES_PER_BLOCK != block {
            block = page_num / PAGES_PER_BLOCK;
            push_record(&mut out, &Record::ExtendedLinearAddress(block as u16))?;
        }

        let Some(page) = image.page(page_num) else {
            continue;
        };

        for block_start in (0..PAGE_WORDS).step_by(RECORD_WORDS) {
            let block_addr = (page_num % PAGES_PER_BLOCK) * PAGE_BYTES + block_start * 2;

            let mut run: Vec<u8> = Vec::new();
            let mut run_start = 0;
            for i in 0..=RECORD_WORDS {
                let word = if i < RECORD_WORDS {
                    page.word(block_start + i)?
                } else {
                    None
                };
                match word {
                    Some(w) => {
                        if run.is_empty() {
                            run_start = i;
                        }
                        run.extend_from_slice(&w.to_le_bytes());
                    }
                    None if !run.is_empty() => {
                        push_record(
                            &mut out,
                            &Record::Data {
                                offset: (block_addr + run_start * 2) as u16,
                                value: std::mem::take(&mut run),
                            },
                        )?;
                    }
                    None => {}
                }
            }
        }
    }

    push_record(&mut out, &Record::EndOfFile)?;
    Ok(out)
}

pub fn load<P: AsRef<Path>>(path: P) -> Result<Image> {
    parse(&fs::read_to_string(path)?)
}

pub fn save<P: AsRef<Path>>(path: P, image: &Image) -> Result<()> {
    fs::write(path, serialize(image)?)?;
    Ok(())
}

fn push_record(out: &mut String, record: &Record) -> Result<()> {
    let line = record
        .to_record_string()
        .map_err(|e| Error::Serialize(format!("{e:?}")))?;
    out.push_str(&line);
    out.push_str("\r\n");
    Ok(())
}

fn reader_error(line: usize, err: ihex::ReaderError) -> Error {
    let reason = match err {
        ihex::ReaderError::ChecksumMismatch(found, expected) => {
            format!("record checksum 0x{found:02X} does not match computed 0x{expected:02X}")
        }
        other => format!("{other:?}"),
    };
    Error::Format { line, reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Page;

    fn image_with(pages: &[(usize, &str)]) -> Image {
        let mut image = Image::new();
        for &(n, text) in pages {
            image.set_page(n, Some(Page::from_hex_str(text).unwrap()));
        }
        image
    }

    #[test]
    fn serialize_known_image() {
        let mut page = Page::new();
        page.set_word(0, Some(0x3000)).unwrap();
        page.set_word(1, Some(0x008C)).unwrap();
        let mut image = Image::new();
        image.set_page(0, Some(page));

        let text = serialize(&image).unwrap();
        assert_eq!(
            text,
            ":020000040000FA\r\n:0400000000308C0040\r\n:00000001FF\r\n"
        );
    }

    #[test]
    fn parse_rejects_bad_checksum() {
        let err = parse(":0400000000308C00FF\r\n:00000001FF\r\n").unwrap_err();
        match err {
            Error::Format { line, reason } => {
                assert_eq!(line, 1);
                assert!(reason.contains("checksum"), "{reason}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn parse_reports_line_numbers() {
        let err = parse(":020000040000FA\r\nnot a record\r\n").unwrap_err();
        match err {
            Error::Format { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn extended_address_maps_high_pages() {
        // Page 0x400 starts at byte address 0x10000.
        let text = ":020000040001F9\r\n:020000001234B8\r\n:00000001FF\r\n";
        let image = parse(text).unwrap();
        assert_eq!(image.page(0x400).unwrap().word(0).unwrap(), Some(0x3412));
    }

    #[test]
    fn round_trip_with_absent_runs() {
        let mut image = Image::new();

        // Dense page with holes at run and block boundaries.
        let p0 = image.page_entry(0);
        for i in 0..PAGE_WORDS {
            if i != 2 && i != 7 && i != 8 && i != 31 {
                p0.set_word(i, Some(0x2800 | i as u16)).unwrap();
            }
        }
        // Sparse page: single words at the edges.
        let p5 = image.page_entry(5);
        p5.set_word(1, Some(0x2C4F)).unwrap();
        p5.set_word(31, Some(0x6C9F)).unwrap();
        // Config page past the 64K boundary, data page further out.
        image
            .page_entry(0x400)
            .set_word(7, Some(0x159F))
            .unwrap();
        image
            .page_entry(0x780)
            .set_span(0, 4, &[Some(0xFF), Some(0xFF), Some(0xFF), Some(0xFF)])
            .unwrap();

        let text = serialize(&image).unwrap();
        let parsed = parse(&text).unwrap();
        assert_eq!(parsed, image);
        // And serialization is stable over the round trip.
        assert_eq!(serialize(&parsed).unwrap(), text);
    }

    #[test]
    fn output_is_crlf_and_terminated() {
        let image = image_with(&[(0, "0130")]);
        let text = serialize(&image).unwrap();
        assert!(text.ends_with(":00000001FF\r\n"));
        // Every line is CRLF terminated and starts with the record mark.
        assert!(
            text.split_inclusive("\r\n")
                .all(|l| l.starts_with(':') && l.ends_with("\r\n"))
        );
    }

    #[test]
    fn absent_spans_are_skipped_not_filled() {
        let image = image_with(&[(0, "0130            0230")]);
        let text = serialize(&image).unwrap();
        // Two records, one per run; nothing for the absent middle words.
        let data_lines: Vec<&str> = text
            .split("\r\n")
            .filter(|l| l.len() > 9 && &l[7..9] == "00")
            .collect();
        assert_eq!(data_lines.len(), 2);
    }
}
