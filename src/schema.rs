//! Schema-tolerant field extraction.
//!
//! Contract generations disagree on how they return the same datum: a named
//! output on one deployment, a differently named output on another, a bare
//! positional value on a third. Each output field is described by an ordered
//! list of [`Candidate`]s and the first candidate whose source succeeded and
//! whose value parses wins.

use ethers::abi::{Param, Token};
use ethers::types::{Address, I256, U256};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Decoded return data of one contract call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRecord {
    /// Outputs that carry a name in the ABI.
    pub named: BTreeMap<String, Value>,
    /// All outputs in declaration order.
    pub positional: Vec<Value>,
}

impl RawRecord {
    /// Build a record from ABI output params and the decoded tokens.
    pub fn from_tokens(outputs: &[Param], tokens: Vec<Token>) -> Self {
        let mut record = RawRecord::default();
        for (i, token) in tokens.into_iter().enumerate() {
            let value = token_to_value(token);
            if let Some(param) = outputs.get(i).filter(|p| !p.name.is_empty()) {
                record.named.insert(param.name.clone(), value.clone());
            }
            record.positional.push(value);
        }
        record
    }

    pub fn with_named(mut self, key: &str, value: impl Into<Value>) -> Self {
        let value = value.into();
        self.named.insert(key.to_string(), value.clone());
        self.positional.push(value);
        self
    }

    pub fn with_positional(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Unsigned integer at output position `index`.
    pub fn uint_at(&self, index: usize) -> Option<U256> {
        self.positional.get(index).and_then(parse_uint)
    }

    pub fn address_at(&self, index: usize) -> Option<Address> {
        match Parser::Address.parse(self.positional.get(index)?)? {
            Parsed::Address(address) => Some(address),
            _ => None,
        }
    }

    pub fn lookup(&self, path: &FieldPath) -> Option<&Value> {
        match path {
            FieldPath::Key(key) => self.named.get(*key),
            FieldPath::Index(i) => self.positional.get(*i),
            FieldPath::Pointer(pointer) => {
                let trimmed = pointer.strip_prefix('/')?;
                let (head, rest) = match trimmed.find('/') {
                    Some(split) => (&trimmed[..split], &trimmed[split..]),
                    None => (trimmed, ""),
                };
                let root = self.named.get(head)?;
                if rest.is_empty() {
                    Some(root)
                } else {
                    root.pointer(rest)
                }
            }
        }
    }
}

/// JSON form of an ABI token. Integers become decimal strings so 256-bit values survive.
pub fn token_to_value(token: Token) -> Value {
    match token {
        Token::Uint(v) => Value::String(v.to_string()),
        Token::Int(v) => Value::String(I256::from_raw(v).to_string()),
        Token::Address(a) => Value::String(format!("{:?}", a)),
        Token::Bool(b) => Value::Bool(b),
        Token::String(s) => Value::String(s),
        Token::Bytes(b) | Token::FixedBytes(b) => Value::String(format!("0x{}", hex::encode(b))),
        Token::Array(items) | Token::FixedArray(items) | Token::Tuple(items) => {
            Value::Array(items.into_iter().map(token_to_value).collect())
        }
    }
}

/// Where to look for a field inside a [`RawRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldPath {
    /// A named output.
    Key(&'static str),
    /// An output by position.
    Index(usize),
    /// A JSON pointer whose first segment is a named output (`/stats/0`).
    Pointer(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parser {
    /// Integer as decimal string, `0x` hex string or JSON number.
    Uint,
    /// Decimal amount in whole units, scaled by the given number of decimals.
    Units(u32),
    Bool,
    Address,
    /// Non-empty string.
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    Uint(U256),
    Bool(bool),
    Address(Address),
    Text(String),
}

impl Parser {
    pub fn parse(&self, value: &Value) -> Option<Parsed> {
        match self {
            Parser::Uint => parse_uint(value).map(Parsed::Uint),
            Parser::Units(decimals) => parse_units(value, *decimals).map(Parsed::Uint),
            Parser::Bool => parse_bool(value).map(Parsed::Bool),
            Parser::Address => value
                .as_str()
                .and_then(|s| s.trim().parse::<Address>().ok())
                .map(Parsed::Address),
            Parser::Text => value
                .as_str()
                .filter(|s| !s.is_empty())
                .map(|s| Parsed::Text(s.to_string())),
        }
    }
}

fn parse_uint(value: &Value) -> Option<U256> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Some(hex) = s.strip_prefix("0x") {
                U256::from_str_radix(hex, 16).ok()
            } else {
                U256::from_dec_str(s).ok()
            }
        }
        Value::Number(n) => n.as_u64().map(U256::from),
        _ => None,
    }
}

fn parse_units(value: &Value, decimals: u32) -> Option<U256> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    ethers::utils::parse_units(text, decimals).ok().map(U256::from)
}

fn parse_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_u64().and_then(|n| match n {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        }),
        Value::String(s) => match s.trim() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// One place a field may be found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub source: &'static str,
    pub path: FieldPath,
    pub parser: Parser,
}

impl Candidate {
    pub const fn new(source: &'static str, path: FieldPath, parser: Parser) -> Self {
        Self { source, path, parser }
    }

    pub const fn uint(source: &'static str, path: FieldPath) -> Self {
        Self::new(source, path, Parser::Uint)
    }
}

/// Successful source reads keyed by source name.
pub type SourceRecords = HashMap<&'static str, RawRecord>;

/// First candidate whose source succeeded and whose value parses.
pub fn resolve(records: &SourceRecords, candidates: &[Candidate]) -> Option<Parsed> {
    candidates.iter().find_map(|candidate| {
        records
            .get(candidate.source)
            .and_then(|record| record.lookup(&candidate.path))
            .and_then(|value| candidate.parser.parse(value))
    })
}

pub fn resolve_uint(records: &SourceRecords, candidates: &[Candidate]) -> Option<U256> {
    match resolve(records, candidates)? {
        Parsed::Uint(v) => Some(v),
        _ => None,
    }
}

pub fn resolve_bool(records: &SourceRecords, candidates: &[Candidate]) -> Option<bool> {
    match resolve(records, candidates)? {
        Parsed::Bool(v) => Some(v),
        _ => None,
    }
}

pub fn resolve_address(records: &SourceRecords, candidates: &[Candidate]) -> Option<Address> {
    match resolve(records, candidates)? {
        Parsed::Address(v) => Some(v),
        _ => None,
    }
}

pub fn resolve_text(records: &SourceRecords, candidates: &[Candidate]) -> Option<String> {
    match resolve(records, candidates)? {
        Parsed::Text(v) => Some(v),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::abi::ParamType;
    use serde_json::json;

    #[test]
    fn test_from_tokens_keeps_names_and_positions() {
        let outputs = vec![
            Param { name: "xenAmount".into(), kind: ParamType::Uint(256), internal_type: None },
            Param { name: "".into(), kind: ParamType::Bool, internal_type: None },
        ];
        let record = RawRecord::from_tokens(
            &outputs,
            vec![Token::Uint(U256::from(500)), Token::Bool(true)],
        );
        assert_eq!(record.named.get("xenAmount"), Some(&json!("500")));
        assert_eq!(record.positional, vec![json!("500"), json!(true)]);
        assert_eq!(record.named.len(), 1);
    }

    #[test]
    fn test_large_uint_survives_as_string() {
        let big = U256::MAX;
        let value = token_to_value(Token::Uint(big));
        assert_eq!(parse_uint(&value), Some(big));
    }

    #[test]
    fn test_pointer_lookup() {
        let record = RawRecord::default().with_named("reserves", json!(["10", "20"]));
        assert_eq!(record.lookup(&FieldPath::Pointer("/reserves/1")), Some(&json!("20")));
        assert_eq!(record.lookup(&FieldPath::Pointer("/reserves")), Some(&json!(["10", "20"])));
        assert_eq!(record.lookup(&FieldPath::Pointer("/missing/0")), None);
    }

    #[test]
    fn test_parsers() {
        assert_eq!(Parser::Uint.parse(&json!("0x1f4")), Some(Parsed::Uint(U256::from(500))));
        assert_eq!(Parser::Uint.parse(&json!(300)), Some(Parsed::Uint(U256::from(300))));
        assert_eq!(Parser::Uint.parse(&json!("not a number")), None);
        assert_eq!(Parser::Uint.parse(&Value::Null), None);
        assert_eq!(
            Parser::Units(18).parse(&json!("1.5")),
            Some(Parsed::Uint(U256::from(15u64) * U256::from(10u64.pow(17))))
        );
        assert_eq!(Parser::Bool.parse(&json!(1)), Some(Parsed::Bool(true)));
        assert_eq!(Parser::Text.parse(&json!("")), None);
    }

    #[test]
    fn test_resolve_first_match_wins() {
        let mut records = SourceRecords::new();
        records.insert("new", RawRecord::default().with_named("totalXenBurned", "500"));
        records.insert("legacy", RawRecord::default().with_named("xenBurned", "300"));

        let candidates = [
            Candidate::uint("new", FieldPath::Key("totalXenBurned")),
            Candidate::uint("legacy", FieldPath::Key("xenBurned")),
        ];
        assert_eq!(resolve_uint(&records, &candidates), Some(U256::from(500)));
    }

    #[test]
    fn test_resolve_skips_unparseable_values() {
        let mut records = SourceRecords::new();
        records.insert("new", RawRecord::default().with_named("totalXenBurned", Value::Null));
        records.insert("legacy", RawRecord::default().with_positional("300"));

        let candidates = [
            Candidate::uint("new", FieldPath::Key("totalXenBurned")),
            Candidate::uint("legacy", FieldPath::Index(0)),
        ];
        assert_eq!(resolve_uint(&records, &candidates), Some(U256::from(300)));
    }

    #[test]
    fn test_resolve_none_when_no_source() {
        let records = SourceRecords::new();
        let candidates = [Candidate::uint("new", FieldPath::Index(0))];
        assert_eq!(resolve(&records, &candidates), None);
    }
}
