/// Scatter-gather list tool
///
/// Inspect and compare scatter-gather lists, and copy blocks between
/// files, block devices and SCSI generic devices as addressed by such
/// lists (like 'sg_dd' with skip and seek lists).
///
/// Features:
///
/// - lists given inline or read from files (`@file`, `@-` for stdin)
/// - optional json output format
/// - multi threaded copy, using SG_IO for `/dev/sg*` devices
use std::time::Instant;

use anyhow::{bail, format_err, Error};
use serde_json::Value;

use proxmox_router::cli::*;
use proxmox_schema::{api, IntegerSchema, Schema, StringSchema};

use sgl_utils::block_io::{BlockIo, FileBlockIo, SgBlockIo, StreamBlockIo};
use sgl_utils::copy::{copy_blocks, CopyOptions, DEFAULT_BLOCK_SIZE, MAX_THREADS};
use sgu_sgl::{sgls_eq_off, ScatterGatherList};
use sgu_tools::num::parse_num;

pub const SGL_SCHEMA: Schema = StringSchema::new(
    "Scatter-gather list, 'LBA,NUM' pairs separated by commas or spaces, \
     or '@FILE' to read the list from a file ('@-' is stdin).",
)
.schema();

pub const NUMBER_SCHEMA: Schema = StringSchema::new(
    "Number, decimal or hex ('0x..' or '..h'), with optional multiplier suffix (k, KiB, kB, M, ...).",
)
.min_length(1)
.schema();

pub const DEVICE_PATH_SCHEMA: Schema =
    StringSchema::new("Path to a file or device, '-' for stdin or stdout.")
        .min_length(1)
        .schema();

pub const THREADS_SCHEMA: Schema = IntegerSchema::new("Number of copy worker threads.")
    .minimum(1)
    .maximum(MAX_THREADS as isize)
    .schema();

fn load_sgl(text: &str, hex: bool, flexible: bool) -> Result<ScatterGatherList, Error> {
    let mut sgl = ScatterGatherList::new();
    match text.strip_prefix('@') {
        Some(path) => sgl
            .load_from_file(path, hex, flexible)
            .map_err(|err| format_err!("unable to load list from '{}' - {}", path, err))?,
        None => sgl
            .load_from_cli(text)
            .map_err(|err| format_err!("unable to parse list '{}' - {}", text, err))?,
    }
    Ok(sgl)
}

fn parse_number_param(param: &Value, name: &str) -> Result<Option<u64>, Error> {
    match param[name].as_str() {
        Some(text) => {
            let num = parse_num(text).map_err(|err| format_err!("parameter '{}': {}", name, err))?;
            Ok(Some(num))
        }
        None => Ok(None),
    }
}

#[api(
    input: {
        properties: {
            sgl: {
                schema: SGL_SCHEMA,
            },
            hex: {
                description: "Numbers in the list file are hex by default.",
                type: bool,
                optional: true,
                default: false,
            },
            flexible: {
                description: "Allow blank lines and '#' comments in the list file.",
                type: bool,
                optional: true,
                default: false,
            },
            show: {
                description: "Also show the list elements.",
                type: bool,
                optional: true,
                default: false,
            },
            "output-format": {
                schema: OUTPUT_FORMAT,
                optional: true,
            },
        },
    },
)]
/// Parse a scatter-gather list and show its properties
fn scan(sgl: String, hex: bool, flexible: bool, show: bool, param: Value) -> Result<(), Error> {
    let output_format = get_output_format(&param);

    let list = load_sgl(&sgl, hex, flexible)?;
    let summary = list.summary(show);

    if output_format == "json-pretty" {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    if output_format == "json" {
        println!("{}", serde_json::to_string(&summary)?);
        return Ok(());
    }

    if output_format != "text" {
        bail!("unknown output format '{}'", output_format);
    }

    print!("{}", list.dbg_print(false, "sgl", show));

    Ok(())
}

#[api(
    input: {
        properties: {
            left: {
                schema: SGL_SCHEMA,
            },
            right: {
                schema: SGL_SCHEMA,
            },
            "allow-partial": {
                description: "Equal if the shorter list is a prefix of the longer one.",
                type: bool,
                optional: true,
                default: false,
            },
            hex: {
                description: "Numbers in list files are hex by default.",
                type: bool,
                optional: true,
                default: false,
            },
            flexible: {
                description: "Allow blank lines and '#' comments in list files.",
                type: bool,
                optional: true,
                default: false,
            },
        },
    },
)]
/// Check that two lists address the same LBA sequence
fn compare(
    left: String,
    right: String,
    allow_partial: bool,
    hex: bool,
    flexible: bool,
) -> Result<(), Error> {
    let left = load_sgl(&left, hex, flexible)?;
    let right = load_sgl(&right, hex, flexible)?;

    if !sgls_eq_off(&left, 0, 0, &right, 0, 0, allow_partial) {
        bail!("lists address different blocks");
    }

    println!("lists are equal");

    Ok(())
}

// stdout cannot carry the copied data and the json statistics at once
fn check_copy_output_format(out_path: &str, output_format: &str) -> Result<(), Error> {
    if out_path == "-" && output_format != "text" {
        bail!(
            "output format '{}' needs stdout, which already carries the copied data",
            output_format
        );
    }
    Ok(())
}

fn open_input(path: &str, sg: bool, block_size: usize) -> Result<Box<dyn BlockIo>, Error> {
    if path == "-" {
        return Ok(Box::new(StreamBlockIo::stdin(block_size)));
    }
    if sg {
        return Ok(Box::new(SgBlockIo::open(path, false, block_size)?));
    }
    Ok(Box::new(FileBlockIo::open_input(path, block_size)?))
}

fn open_output(path: &str, sg: bool, block_size: usize) -> Result<Box<dyn BlockIo>, Error> {
    if path == "-" {
        return Ok(Box::new(StreamBlockIo::stdout(block_size)));
    }
    if sg {
        return Ok(Box::new(SgBlockIo::open(path, true, block_size)?));
    }
    Ok(Box::new(FileBlockIo::open_output(path, block_size)?))
}

#[api(
    input: {
        properties: {
            "if": {
                schema: DEVICE_PATH_SCHEMA,
            },
            "of": {
                schema: DEVICE_PATH_SCHEMA,
            },
            bs: {
                schema: NUMBER_SCHEMA,
                optional: true,
            },
            skip: {
                schema: SGL_SCHEMA,
                optional: true,
            },
            seek: {
                schema: SGL_SCHEMA,
                optional: true,
            },
            count: {
                schema: NUMBER_SCHEMA,
                optional: true,
            },
            threads: {
                schema: THREADS_SCHEMA,
                optional: true,
            },
            chunk: {
                schema: NUMBER_SCHEMA,
                optional: true,
            },
            "sg-in": {
                description: "Access the input with SCSI commands (SG_IO).",
                type: bool,
                optional: true,
                default: false,
            },
            "sg-out": {
                description: "Access the output with SCSI commands (SG_IO).",
                type: bool,
                optional: true,
                default: false,
            },
            hex: {
                description: "Numbers in list files are hex by default.",
                type: bool,
                optional: true,
                default: false,
            },
            flexible: {
                description: "Allow blank lines and '#' comments in list files.",
                type: bool,
                optional: true,
                default: false,
            },
            "output-format": {
                schema: OUTPUT_FORMAT,
                optional: true,
            },
        },
    },
)]
/// Copy the blocks addressed by the skip list of the input to the
/// blocks addressed by the seek list of the output
#[allow(clippy::too_many_arguments)]
fn copy(
    skip: Option<String>,
    seek: Option<String>,
    threads: Option<usize>,
    sg_in: bool,
    sg_out: bool,
    hex: bool,
    flexible: bool,
    param: Value,
) -> Result<(), Error> {
    let output_format = get_output_format(&param);

    let in_path = param["if"]
        .as_str()
        .ok_or_else(|| format_err!("missing input path"))?;
    let out_path = param["of"]
        .as_str()
        .ok_or_else(|| format_err!("missing output path"))?;
    check_copy_output_format(out_path, &output_format)?;

    let block_size = match parse_number_param(&param, "bs")? {
        Some(bs) => usize::try_from(bs)?,
        None => DEFAULT_BLOCK_SIZE,
    };
    let count = parse_number_param(&param, "count")?;

    let mut options = CopyOptions::new().block_size(block_size).count(count);
    if let Some(chunk) = parse_number_param(&param, "chunk")? {
        options = options.chunk_blocks(u32::try_from(chunk)?);
    }
    if let Some(threads) = threads {
        options = options.threads(threads);
    }

    let in_sgl = load_sgl(skip.as_deref().unwrap_or("0,-1"), hex, flexible)?;
    let out_sgl = load_sgl(seek.as_deref().unwrap_or("0,-1"), hex, flexible)?;

    let mut input = open_input(in_path, sg_in, block_size)?;
    let mut output = open_output(out_path, sg_out, block_size)?;

    let start_time = Instant::now();
    let stats = copy_blocks(input.as_mut(), output.as_mut(), &in_sgl, &out_sgl, &options)?;
    let elapsed = start_time.elapsed().as_secs_f64();

    if output_format == "json-pretty" {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    if output_format == "json" {
        println!("{}", serde_json::to_string(&stats)?);
        return Ok(());
    }

    if output_format != "text" {
        bail!("unknown output format '{}'", output_format);
    }

    // stdout may carry the copied data
    log::info!(
        "{} blocks ({} bytes) copied in {} transfers, {:.2}s",
        stats.blocks,
        stats.bytes,
        stats.segments,
        elapsed
    );
    if stats.short_reads > 0 {
        log::info!("input ended early ({} short reads)", stats.short_reads);
    }

    Ok(())
}

fn main() {
    init_cli_logger("SGL_LOG", "info");

    let cmd_def = CliCommandMap::new()
        .insert("scan", CliCommand::new(&API_METHOD_SCAN).arg_param(&["sgl"]))
        .insert(
            "compare",
            CliCommand::new(&API_METHOD_COMPARE).arg_param(&["left", "right"]),
        )
        .insert("copy", CliCommand::new(&API_METHOD_COPY));

    let rpcenv = CliEnvironment::new();

    run_cli_command(cmd_def, rpcenv, None);
}
