//! XML property-list parsing using `nom`.
//!
//! Covers the subset emitted by the volume and preference utilities:
//! `dict`, `array`, `string`, `integer`, `real`, `true`, `false`, `date`,
//! and `data`. Absent keys are the caller's business; this module only
//! rejects text that is not a property list.

use std::collections::BTreeMap;

use appvault_common::error::{Result, VaultError};
use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_until},
    character::complete::{char, multispace0, multispace1},
    combinator::{map, map_res, value},
    multi::many0,
};

/// A parsed property-list value.
#[derive(Debug, Clone, PartialEq)]
pub enum PlistValue {
    /// `<dict>`.
    Dict(BTreeMap<String, PlistValue>),
    /// `<array>`.
    Array(Vec<PlistValue>),
    /// `<string>`, entities decoded.
    String(String),
    /// `<integer>`.
    Integer(i64),
    /// `<real>`.
    Real(f64),
    /// `<true/>` or `<false/>`.
    Boolean(bool),
    /// `<date>`, ISO-8601 text as written.
    Date(String),
    /// `<data>`, base64 text with whitespace removed.
    Data(String),
}

impl PlistValue {
    /// Looks up `key` when this is a dictionary.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Self> {
        match self {
            Self::Dict(map) => map.get(key),
            _ => None,
        }
    }

    /// String content, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Boolean content, if this is a boolean.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer content, if this is an integer.
    #[must_use]
    pub const fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Elements, if this is an array.
    #[must_use]
    pub fn as_array(&self) -> Option<&[Self]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// String stored under `key`, ignoring empty strings.
    #[must_use]
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.get(key)
            .and_then(Self::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Boolean stored under `key`.
    #[must_use]
    pub fn bool_field(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Self::as_bool)
    }
}

/// Whitespace, comments, the XML declaration, and the doctype.
fn trivia(input: &str) -> IResult<&str, ()> {
    let ws = value((), multispace1);
    let decl = value((), (tag("<?"), take_until("?>"), tag("?>")));
    let comment = value((), (tag("<!--"), take_until("-->"), tag("-->")));
    let doctype = value((), (tag("<!DOCTYPE"), take_until(">"), char('>')));
    let (input, _) = many0(alt((ws, decl, comment, doctype))).parse(input)?;
    Ok((input, ()))
}

/// `<name/>`, with optional whitespace before the slash.
fn empty_tag<'a>(name: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, ()> {
    move |input| value((), (char('<'), tag(name), multispace0, tag("/>"))).parse(input)
}

fn open_tag<'a>(name: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, ()> {
    move |input| value((), (char('<'), tag(name), multispace0, char('>'))).parse(input)
}

fn close_tag<'a>(name: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, ()> {
    move |input| value((), (tag("</"), tag(name), multispace0, char('>'))).parse(input)
}

/// `<name>text</name>` or `<name/>`, yielding the raw text.
fn text_element<'a>(name: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    move |input| {
        alt((
            value("", empty_tag(name)),
            map(
                (open_tag(name), take_until("</"), close_tag(name)),
                |((), text, ())| text,
            ),
        ))
        .parse(input)
    }
}

fn dict_entry(input: &str) -> IResult<&str, (String, PlistValue)> {
    let (input, ()) = trivia(input)?;
    let (input, key) = text_element("key")(input)?;
    let (input, val) = plist_value(input)?;
    Ok((input, (decode_entities(key), val)))
}

fn dict(input: &str) -> IResult<&str, PlistValue> {
    alt((
        value(PlistValue::Dict(BTreeMap::new()), empty_tag("dict")),
        map(
            (open_tag("dict"), many0(dict_entry), trivia, close_tag("dict")),
            |((), entries, (), ())| PlistValue::Dict(entries.into_iter().collect()),
        ),
    ))
    .parse(input)
}

fn array_item(input: &str) -> IResult<&str, PlistValue> {
    plist_value(input)
}

fn array(input: &str) -> IResult<&str, PlistValue> {
    alt((
        value(PlistValue::Array(Vec::new()), empty_tag("array")),
        map(
            (open_tag("array"), many0(array_item), trivia, close_tag("array")),
            |((), items, (), ())| PlistValue::Array(items),
        ),
    ))
    .parse(input)
}

fn scalar(input: &str) -> IResult<&str, PlistValue> {
    alt((
        map(text_element("string"), |s| {
            PlistValue::String(decode_entities(s))
        }),
        map_res(text_element("integer"), |s| {
            s.trim().parse::<i64>().map(PlistValue::Integer)
        }),
        map_res(text_element("real"), |s| {
            s.trim().parse::<f64>().map(PlistValue::Real)
        }),
        value(PlistValue::Boolean(true), empty_tag("true")),
        value(PlistValue::Boolean(false), empty_tag("false")),
        map(text_element("date"), |s| PlistValue::Date(s.trim().to_string())),
        map(text_element("data"), |s| {
            PlistValue::Data(s.split_whitespace().collect())
        }),
    ))
    .parse(input)
}

fn plist_value(input: &str) -> IResult<&str, PlistValue> {
    let (input, ()) = trivia(input)?;
    alt((dict, array, scalar)).parse(input)
}

fn document(input: &str) -> IResult<&str, PlistValue> {
    let (input, ()) = trivia(input)?;
    let wrapped = map(
        (
            tag("<plist"),
            take_until(">"),
            char('>'),
            plist_value,
            trivia,
            close_tag("plist"),
        ),
        |(_, _, _, val, (), ())| val,
    );
    let (input, val) = alt((wrapped, plist_value)).parse(input)?;
    let (input, ()) = trivia(input)?;
    Ok((input, val))
}

/// Parses an XML property list.
///
/// # Errors
///
/// Returns [`VaultError::Plist`] if the text is not a well-formed property
/// list of the supported subset, or has trailing content.
pub fn parse(input: &str) -> Result<PlistValue> {
    let (rest, val) = document(input).map_err(|e| VaultError::Plist {
        message: format!("{e}"),
    })?;
    if !rest.is_empty() {
        return Err(VaultError::Plist {
            message: format!(
                "unexpected content at: \"{}\"",
                &rest[..rest.len().min(20)]
            ),
        });
    }
    Ok(val)
}

/// Decodes the predefined XML entities and numeric character references.
/// Unknown entities are kept verbatim.
#[must_use]
pub fn decode_entities(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        let Some(end) = tail.find(';') else {
            out.push_str(tail);
            return out;
        };
        let entity = &tail[1..end];
        let decoded = match entity {
            "lt" => Some('<'),
            "gt" => Some('>'),
            "amp" => Some('&'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
                .map_or_else(
                    || entity.strip_prefix('#').and_then(|d| d.parse::<u32>().ok()),
                    |hex| u32::from_str_radix(hex, 16).ok(),
                )
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
