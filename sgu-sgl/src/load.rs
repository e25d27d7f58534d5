use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use sgu_tools::nom::{field_list, parse_complete_line};
use sgu_tools::num::{parse_hex_num, parse_num};

use crate::{BlockCount, ScatterGatherList, SgElem, SglError, SG_SGL_MAX_ELEMENTS};

fn parse_field(index: usize, token: &str, hex: bool) -> Result<u64, SglError> {
    let result = if hex {
        parse_hex_num(token)
    } else {
        parse_num(token)
    };
    result.map_err(|err| SglError::BadNumber {
        index,
        token: token.to_string(),
        reason: err.to_string(),
    })
}

fn parse_count(index: usize, token: &str, hex: bool) -> Result<BlockCount, SglError> {
    if token == "-1" {
        return Ok(BlockCount::Unbounded);
    }
    let num = parse_field(index, token, hex)?;
    let num = u32::try_from(num).map_err(|_| SglError::CountTooLarge(num))?;
    Ok(BlockCount::Bounded(num))
}

/// Collects `LBA,NUM` fields into elements, pairing them up in order
#[derive(Default)]
struct ElemCollector {
    elems: Vec<SgElem>,
    pending_lba: Option<u64>,
    fields: usize,
}

impl ElemCollector {
    fn push(&mut self, token: &str, hex: bool) -> Result<(), SglError> {
        let index = self.fields;
        self.fields += 1;

        match self.pending_lba.take() {
            None => self.pending_lba = Some(parse_field(index, token, hex)?),
            Some(lba) => {
                let count = parse_count(index, token, hex)?;
                if self.elems.len() >= SG_SGL_MAX_ELEMENTS {
                    return Err(SglError::TooManyElements);
                }
                self.elems.push(SgElem { lba, count });
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<Vec<SgElem>, SglError> {
        if self.pending_lba.is_some() {
            return Err(SglError::OddCount(self.fields));
        }
        Ok(self.elems)
    }
}

fn elems_from_text(text: &str) -> Result<Vec<SgElem>, SglError> {
    let fields = parse_complete_line("scatter-gather list", text, field_list)
        .map_err(|err| SglError::Syntax(err.to_string()))?;

    let mut collector = ElemCollector::default();
    for field in fields {
        collector.push(field, false)?;
    }
    collector.finish()
}

fn elems_from_reader<R: BufRead>(
    reader: R,
    name: &str,
    def_hex: bool,
    flexible: bool,
) -> Result<Vec<SgElem>, SglError> {
    let mut collector = ElemCollector::default();
    let mut hex = def_hex;

    for (line_no, line) in reader.lines().enumerate() {
        let line = line.map_err(|source| SglError::Io {
            path: name.to_string(),
            source,
        })?;

        let mut content = line.as_str();
        if flexible {
            if let Some(pos) = content.find('#') {
                content = &content[..pos];
            }
        }
        let content = content.trim();

        if content.is_empty() {
            if flexible {
                continue;
            }
            return Err(SglError::Syntax(format!(
                "{}: empty line {}",
                name,
                line_no + 1
            )));
        }

        // 'HEX' on its own line: the remaining numbers are hex
        if let Some(rest) = content.strip_prefix("HEX") {
            if rest.trim().is_empty() {
                hex = true;
                continue;
            }
        }

        let fields = parse_complete_line("scatter-gather list", content, field_list)
            .map_err(|err| SglError::Syntax(format!("{} line {}: {}", name, line_no + 1, err)))?;

        let line_start = collector.fields;
        for field in fields {
            collector.push(field, hex)?;
        }

        if !flexible && collector.pending_lba.is_some() {
            return Err(SglError::OddCount(collector.fields - line_start));
        }
    }

    collector.finish()
}

impl ScatterGatherList {
    /// Replace the list with the `LBA,NUM` pairs given on the command line
    ///
    /// Numbers are separated by commas or whitespace. On error the list is
    /// left empty.
    pub fn load_from_cli(&mut self, text: &str) -> Result<(), SglError> {
        let elems = elems_from_text(text);
        self.install(elems)
    }

    /// Replace the list with the pairs read from a file (`-` is stdin)
    ///
    /// `def_hex` makes hex the default number base, `flexible` tolerates
    /// blank lines and `#` comments. On error the list is left empty and
    /// OS errors are kept in [`Self::os_errno`].
    pub fn load_from_file<P: AsRef<Path>>(
        &mut self,
        path: P,
        def_hex: bool,
        flexible: bool,
    ) -> Result<(), SglError> {
        let path = path.as_ref();
        let name = path.to_string_lossy();

        if path == Path::new("-") {
            let stdin = std::io::stdin();
            return self.load_from_reader(stdin.lock(), "<stdin>", def_hex, flexible);
        }

        let elems = File::open(path)
            .map_err(|source| SglError::Io {
                path: name.to_string(),
                source,
            })
            .and_then(|file| elems_from_reader(BufReader::new(file), &name, def_hex, flexible));

        self.install(elems)
    }

    /// Like [`Self::load_from_file`], reading from an already open stream
    pub fn load_from_reader<R: BufRead>(
        &mut self,
        reader: R,
        name: &str,
        def_hex: bool,
        flexible: bool,
    ) -> Result<(), SglError> {
        let elems = elems_from_reader(reader, name, def_hex, flexible);
        self.install(elems)
    }

    fn install(&mut self, elems: Result<Vec<SgElem>, SglError>) -> Result<(), SglError> {
        self.reset();

        let result = elems.and_then(|elems| self.set_elems(elems));

        if let Err(err) = &result {
            let errno = match err {
                SglError::Io { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
                _ => 0,
            };
            self.reset();
            self.m_errno = errno;
            log::debug!("loading scatter-gather list failed - {}", err);
        }

        result
    }
}
