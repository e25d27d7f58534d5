//! Numeric literals as used on the command line of the sg utilities
//!
//! Numbers are decimal unless prefixed with `0x`/`0X` or followed by a
//! trailing `h`/`H`, which both mean hexadecimal. Decimal numbers may
//! carry a multiplier suffix and may be written as a product
//! (`<num>x<num>`):
//!
//! | suffix              | multiplier |
//! |---------------------|------------|
//! | `c`                 | 1          |
//! | `w`                 | 2          |
//! | `b`                 | 512        |
//! | `k`, `K`, `KiB`     | 1024       |
//! | `kB`, `KB`          | 1000       |
//! | `m`, `M`, `MiB`     | 1024^2     |
//! | `MB`                | 1000^2     |
//! | `g`, `G`, `GiB`     | 1024^3     |
//! | `GB`                | 1000^3     |
//! | `t`, `T`, `TiB`     | 1024^4     |
//! | `TB`                | 1000^4     |
//! | `p`, `P`, `PiB`     | 1024^5     |
//! | `PB`                | 1000^5     |

use anyhow::{format_err, Error};

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while},
    character::complete::{char, digit1, hex_digit1, one_of},
    combinator::{map_res, opt},
    sequence::{pair, preceded, terminated, tuple},
};

use crate::nom::{parse_complete_line, parse_error, IResult};

fn multiplier(suffix: &str) -> Option<u64> {
    let value = match suffix {
        "" | "c" => 1,
        "w" => 2,
        "b" => 512,
        "k" | "K" | "KiB" => 1024,
        "kB" | "KB" => 1000,
        "m" | "M" | "MiB" => 1024 * 1024,
        "MB" => 1000 * 1000,
        "g" | "G" | "GiB" => 1024 * 1024 * 1024,
        "GB" => 1000 * 1000 * 1000,
        "t" | "T" | "TiB" => 1024u64.pow(4),
        "TB" => 1000u64.pow(4),
        "p" | "P" | "PiB" => 1024u64.pow(5),
        "PB" => 1000u64.pow(5),
        _ => return None,
    };
    Some(value)
}

fn from_hex(digits: &str) -> Result<u64, Error> {
    u64::from_str_radix(digits, 16).map_err(|err| format_err!("bad hex number - {}", err))
}

/// Hex number with `0x`/`0X` prefix
fn prefixed_hex(i: &str) -> IResult<&str, u64> {
    map_res(
        preceded(alt((tag("0x"), tag("0X"))), hex_digit1),
        from_hex,
    )(i)
}

/// Hex number with trailing `h`/`H`
fn suffixed_hex(i: &str) -> IResult<&str, u64> {
    map_res(terminated(hex_digit1, one_of("hH")), from_hex)(i)
}

/// Decimal number with optional multiplier suffix
fn scaled_decimal(i: &str) -> IResult<&str, u64> {
    let (rest, (digits, suffix)) = pair(
        digit1,
        take_while(|c: char| c.is_ascii_alphabetic() && c != 'x'),
    )(i)?;

    let value: u64 = digits.parse().map_err(|_| parse_error(i, "decimal number too large"))?;
    let factor = multiplier(suffix).ok_or_else(|| parse_error(suffix, "unknown multiplier suffix"))?;
    let value = value
        .checked_mul(factor)
        .ok_or_else(|| parse_error(i, "number too large"))?;

    Ok((rest, value))
}

/// Parse a numeric literal (decimal, hex, multiplier suffix or product)
pub fn num_literal(i: &str) -> IResult<&str, u64> {
    let (rest, value) = alt((prefixed_hex, suffixed_hex, scaled_decimal))(i)?;

    match opt(preceded(char('x'), num_literal))(rest)? {
        (rest, Some(factor)) => {
            let value = value
                .checked_mul(factor)
                .ok_or_else(|| parse_error(i, "product too large"))?;
            Ok((rest, value))
        }
        (rest, None) => Ok((rest, value)),
    }
}

/// Parse a number that is hexadecimal by default (`0x` prefix and
/// trailing `h` are tolerated)
pub fn hex_literal(i: &str) -> IResult<&str, u64> {
    alt((
        prefixed_hex,
        map_res(
            tuple((hex_digit1, opt(one_of("hH")))),
            |(digits, _): (&str, Option<char>)| from_hex(digits),
        ),
    ))(i)
}

/// Parse a complete numeric literal
pub fn parse_num(text: &str) -> Result<u64, Error> {
    parse_complete_line("number", text, num_literal)
}

/// Parse a complete numeric literal, hex by default
pub fn parse_hex_num(text: &str) -> Result<u64, Error> {
    parse_complete_line("hex number", text, hex_literal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decimal_and_hex() -> Result<(), Error> {
        assert_eq!(parse_num("0")?, 0);
        assert_eq!(parse_num("1234")?, 1234);
        assert_eq!(parse_num("0x10")?, 16);
        assert_eq!(parse_num("0XA")?, 10);
        assert_eq!(parse_num("10h")?, 16);
        assert_eq!(parse_num("1bH")?, 27);
        assert_eq!(parse_num("0X4D2")?, 1234);
        assert_eq!(parse_num("4d2h")?, 1234);
        assert_eq!(parse_num("0xffffffffffffffff")?, u64::MAX);

        assert!(parse_num("").is_err());
        assert!(parse_num("0x").is_err());
        assert!(parse_num("12q").is_err());
        assert!(parse_num("-1").is_err());
        assert!(parse_num("0x1ffffffffffffffff").is_err());

        Ok(())
    }

    #[test]
    fn test_multipliers() -> Result<(), Error> {
        assert_eq!(parse_num("2b")?, 1024);
        assert_eq!(parse_num("3w")?, 6);
        assert_eq!(parse_num("4k")?, 4096);
        assert_eq!(parse_num("4KB")?, 4000);
        assert_eq!(parse_num("1MiB")?, 1024 * 1024);
        assert_eq!(parse_num("2g")?, 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_num("1PB")?, 1000u64.pow(5));
        assert_eq!(parse_num("2x512")?, 1024);
        assert_eq!(parse_num("2x0x10")?, 32);

        assert!(parse_num("20000p").is_err());

        Ok(())
    }

    #[test]
    fn test_hex_default() -> Result<(), Error> {
        assert_eq!(parse_hex_num("10")?, 16);
        assert_eq!(parse_hex_num("0x10")?, 16);
        assert_eq!(parse_hex_num("1bh")?, 27);
        assert_eq!(parse_hex_num("ab")?, 171);

        assert!(parse_hex_num("xyz").is_err());

        Ok(())
    }
}
