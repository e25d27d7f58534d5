use anyhow::{bail, Error};

use nom::{
    branch::alt,
    bytes::complete::{take_while, take_while1},
    character::complete::char,
    combinator::{all_consuming, recognize},
    error::{ContextError, VerboseError},
    multi::separated_list0,
    sequence::{delimited, tuple},
};

pub type IResult<I, O, E = VerboseError<I>> = Result<(I, O), nom::Err<E>>;

pub fn parse_error<'a>(i: &'a str, context: &'static str) -> nom::Err<VerboseError<&'a str>> {
    let err = VerboseError { errors: Vec::new() };
    let err = VerboseError::add_context(i, context, err);
    nom::Err::Error(err)
}

/// True for characters separating the fields of a range list (comma or whitespace)
pub fn is_field_separator(c: char) -> bool {
    c == ',' || c.is_ascii_whitespace()
}

/// Recognizes zero or more whitespace characters (including line feeds)
pub fn multispace0(i: &str) -> IResult<&str, &str> {
    take_while(|c: char| c.is_ascii_whitespace())(i)
}

/// Recognizes one or more whitespace characters (including line feeds)
pub fn multispace1(i: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_whitespace())(i)
}

/// Recognizes a field separator: a single comma surrounded by optional
/// whitespace, or a run of whitespace.
pub fn field_separator(i: &str) -> IResult<&str, &str> {
    alt((
        recognize(tuple((multispace0, char(','), multispace0))),
        multispace1,
    ))(i)
}

/// Recognizes one field (a run of non-separator characters)
pub fn field(i: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !is_field_separator(c))(i)
}

/// Split a comma/whitespace separated list into its fields
///
/// Leading and trailing whitespace is ignored, empty fields (",,") are
/// rejected.
pub fn field_list(i: &str) -> IResult<&str, Vec<&str>> {
    delimited(multispace0, separated_list0(field_separator, field), multispace0)(i)
}

/// Parse complete input, generate simple error message (use this for sinple line input).
pub fn parse_complete_line<'a, F, O>(what: &str, i: &'a str, parser: F) -> Result<O, Error>
where
    F: Fn(&'a str) -> IResult<&'a str, O>,
{
    match all_consuming(parser)(i) {
        Err(nom::Err::Error(VerboseError { errors }))
        | Err(nom::Err::Failure(VerboseError { errors })) => {
            if errors.is_empty() {
                bail!("unable to parse {}", what);
            } else {
                bail!(
                    "unable to parse {} at '{}' - {:?}",
                    what,
                    errors[0].0,
                    errors[0].1
                );
            }
        }
        Err(err) => {
            bail!("unable to parse {} - {}", what, err);
        }
        Ok((_, data)) => Ok(data),
    }
}
