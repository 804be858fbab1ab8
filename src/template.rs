//! Message templates. A template is plain text with `{{...}}` actions that are
//! expanded on every render, so each generated payload can differ per call.
//!
//! Supported actions:
//! - `{{Seq}}` - the caller's own sequence number
//! - `{{RandomNum}}` / `{{RandomNum 500}}` - random integer below the max (default 10000)
//! - `{{RandomUUID}}` - v4 UUID
//! - `{{RandomAlphaNumeric}}` / `{{RandomAlphaNumeric 16}}` - random [a-zA-Z0-9] string (default length 10)
//! - `{{UniqSeq "group"}}` / `{{UniqSeq "group" 10}}` - globally unique counter per group

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use rand::Rng;
use thiserror::Error;
use uuid::Uuid;

const DEFAULT_RANDOM_MAX: u64 = 10_000;
const DEFAULT_ALPHANUMERIC_LEN: usize = 10;
const ALPHANUMERIC_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("unclosed action at byte {0}")]
    Unclosed(usize),
    #[error("empty action")]
    EmptyAction,
    #[error("unknown template function {0:?}")]
    UnknownFunction(String),
    #[error("invalid argument {arg:?} for {func}")]
    BadArgument { func: &'static str, arg: String },
    #[error("{func} takes at most {max} argument(s)")]
    TooManyArguments { func: &'static str, max: usize },
    #[error("UniqSeq requires a group name")]
    MissingGroup,
}

/// Per-call data available to template actions.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgContext {
    pub seq: u64,
}

/// Named monotonic counters shared by every template that references the same
/// group. Two concurrent callers asking for the same group never observe the
/// same value.
#[derive(Debug, Default)]
pub struct SeqRegistry {
    groups: DashMap<String, AtomicU64>,
}

impl SeqRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current value for `group` and bumps it, creating the
    /// counter at `start` on first use.
    pub fn next(&self, group: &str, start: u64) -> u64 {
        if let Some(counter) = self.groups.get(group) {
            return counter.fetch_add(1, Ordering::Relaxed);
        }
        self.groups
            .entry(group.to_owned())
            .or_insert_with(|| AtomicU64::new(start))
            .fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Seq,
    RandomNum(Option<u64>),
    RandomUuid,
    RandomAlphaNumeric(Option<usize>),
    UniqSeq { group: String, start: u64 },
}

/// A template parsed once at construction; rendering never fails.
#[derive(Debug, Clone)]
pub struct Template {
    segments: Vec<Segment>,
    raw_len: usize,
}

impl Template {
    pub fn parse(input: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = input;
        let mut offset = 0;

        while let Some(open) = rest.find("{{") {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_owned()));
            }
            let after = &rest[open + 2..];
            let close = after
                .find("}}")
                .ok_or(TemplateError::Unclosed(offset + open))?;
            segments.push(parse_action(after[..close].trim())?);
            offset += open + 2 + close + 2;
            rest = &after[close + 2..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_owned()));
        }

        Ok(Self {
            segments,
            raw_len: input.len(),
        })
    }

    pub fn render(&self, registry: &SeqRegistry, ctx: &MsgContext) -> String {
        let mut out = String::with_capacity(self.raw_len * 2);
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Seq => out.push_str(&ctx.seq.to_string()),
                Segment::RandomNum(max) => {
                    let max = max.unwrap_or(DEFAULT_RANDOM_MAX);
                    out.push_str(&rand::rng().random_range(0..max).to_string());
                }
                Segment::RandomUuid => out.push_str(&Uuid::new_v4().to_string()),
                Segment::RandomAlphaNumeric(len) => {
                    let len = len.unwrap_or(DEFAULT_ALPHANUMERIC_LEN);
                    let mut rng = rand::rng();
                    for _ in 0..len {
                        let idx = rng.random_range(0..ALPHANUMERIC_CHARS.len());
                        out.push(ALPHANUMERIC_CHARS[idx] as char);
                    }
                }
                Segment::UniqSeq { group, start } => {
                    out.push_str(&registry.next(group, *start).to_string());
                }
            }
        }
        out
    }
}

fn parse_action(action: &str) -> Result<Segment, TemplateError> {
    let mut parts = action.split_whitespace();
    let name = parts.next().ok_or(TemplateError::EmptyAction)?;
    let args: Vec<&str> = parts.collect();

    match name {
        "Seq" | ".Seq" => {
            expect_args("Seq", &args, 0)?;
            Ok(Segment::Seq)
        }
        "RandomNum" => {
            expect_args("RandomNum", &args, 1)?;
            let max = args.first().map(|arg| parse_number("RandomNum", arg)).transpose()?;
            if max == Some(0) {
                return Err(TemplateError::BadArgument {
                    func: "RandomNum",
                    arg: "0".to_owned(),
                });
            }
            Ok(Segment::RandomNum(max))
        }
        "RandomUUID" => {
            expect_args("RandomUUID", &args, 0)?;
            Ok(Segment::RandomUuid)
        }
        "RandomAlphaNumeric" => {
            expect_args("RandomAlphaNumeric", &args, 1)?;
            let len = args
                .first()
                .map(|arg| parse_number("RandomAlphaNumeric", arg))
                .transpose()?;
            Ok(Segment::RandomAlphaNumeric(len.map(|l| l as usize)))
        }
        "UniqSeq" => {
            expect_args("UniqSeq", &args, 2)?;
            let group = unquote(args.first().ok_or(TemplateError::MissingGroup)?);
            if group.is_empty() {
                return Err(TemplateError::MissingGroup);
            }
            let start = args
                .get(1)
                .map(|arg| parse_number("UniqSeq", arg))
                .transpose()?
                .unwrap_or(0);
            Ok(Segment::UniqSeq {
                group: group.to_owned(),
                start,
            })
        }
        other => Err(TemplateError::UnknownFunction(other.to_owned())),
    }
}

fn expect_args(func: &'static str, args: &[&str], max: usize) -> Result<(), TemplateError> {
    if args.len() > max {
        return Err(TemplateError::TooManyArguments { func, max });
    }
    Ok(())
}

fn parse_number(func: &'static str, arg: &str) -> Result<u64, TemplateError> {
    arg.parse().map_err(|_| TemplateError::BadArgument {
        func,
        arg: arg.to_owned(),
    })
}

fn unquote(arg: &str) -> &str {
    arg.strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(arg)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    fn render(input: &str, ctx: MsgContext) -> String {
        let registry = SeqRegistry::new();
        Template::parse(input).unwrap().render(&registry, &ctx)
    }

    #[test]
    fn literal_passthrough() {
        assert_eq!(render("hello world", MsgContext::default()), "hello world");
        assert_eq!(render("", MsgContext::default()), "");
    }

    #[test]
    fn seq_comes_from_context() {
        assert_eq!(render("msg-{{Seq}}", MsgContext { seq: 42 }), "msg-42");
        assert_eq!(render("{{.Seq}}", MsgContext { seq: 7 }), "7");
    }

    #[test]
    fn random_num_respects_max() {
        for _ in 0..100 {
            let out = render("{{RandomNum 5}}", MsgContext::default());
            let n: u64 = out.parse().unwrap();
            assert!(n < 5);
        }
    }

    #[test]
    fn random_alphanumeric_length() {
        let out = render("{{RandomAlphaNumeric 16}}", MsgContext::default());
        assert_eq!(out.len(), 16);
        assert!(out.bytes().all(|b| b.is_ascii_alphanumeric()));

        let out = render("{{RandomAlphaNumeric}}", MsgContext::default());
        assert_eq!(out.len(), 10);
    }

    #[test]
    fn random_uuid_shape() {
        let out = render("{{RandomUUID}}", MsgContext::default());
        assert_eq!(out.len(), 36);
        assert_eq!(out.matches('-').count(), 4);
    }

    #[test]
    fn mixed_template() {
        let registry = SeqRegistry::new();
        let tmpl = Template::parse(r#"{"id":{{UniqSeq "ids" 100}},"seq":{{Seq}}}"#).unwrap();
        assert_eq!(
            tmpl.render(&registry, &MsgContext { seq: 1 }),
            r#"{"id":100,"seq":1}"#
        );
        assert_eq!(
            tmpl.render(&registry, &MsgContext { seq: 2 }),
            r#"{"id":101,"seq":2}"#
        );
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(
            Template::parse("{{Nope}}"),
            Err(TemplateError::UnknownFunction(_))
        ));
        assert!(matches!(
            Template::parse("{{RandomNum"),
            Err(TemplateError::Unclosed(_))
        ));
        assert!(matches!(
            Template::parse("{{}}"),
            Err(TemplateError::EmptyAction)
        ));
        assert!(matches!(
            Template::parse("{{RandomNum abc}}"),
            Err(TemplateError::BadArgument { .. })
        ));
        assert!(matches!(
            Template::parse("{{UniqSeq}}"),
            Err(TemplateError::MissingGroup)
        ));
        assert!(matches!(
            Template::parse("{{Seq 1}}"),
            Err(TemplateError::TooManyArguments { .. })
        ));
    }

    #[test]
    fn uniq_seq_groups_are_independent() {
        let registry = SeqRegistry::new();
        assert_eq!(registry.next("a", 0), 0);
        assert_eq!(registry.next("a", 0), 1);
        assert_eq!(registry.next("b", 5), 5);
        assert_eq!(registry.next("a", 0), 2);
        assert_eq!(registry.next("b", 5), 6);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn uniq_seq_concurrent_values_are_distinct() {
        const TASKS: usize = 500;
        const CALLS_PER_TASK: usize = 100;

        let registry = Arc::new(SeqRegistry::new());
        let tmpl = Arc::new(Template::parse(r#"{{UniqSeq "test" 10}}"#).unwrap());

        let mut handles = Vec::with_capacity(TASKS);
        for _ in 0..TASKS {
            let registry = Arc::clone(&registry);
            let tmpl = Arc::clone(&tmpl);
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::with_capacity(CALLS_PER_TASK);
                for _ in 0..CALLS_PER_TASK {
                    let out = tmpl.render(&registry, &MsgContext::default());
                    seen.push(out.parse::<u64>().unwrap());
                }
                seen
            }));
        }

        let mut all = HashSet::new();
        for handle in handles {
            for value in handle.await.unwrap() {
                assert!(all.insert(value), "duplicate unique sequence value {value}");
            }
        }

        let total = TASKS * CALLS_PER_TASK;
        assert_eq!(all.len(), total);
        assert_eq!(all.iter().min().copied(), Some(10));
        assert_eq!(all.iter().max().copied(), Some(10 + total as u64 - 1));
    }
}
