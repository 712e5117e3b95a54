use std::ops::Range;
use thiserror::Error;

// Torrent files nest a handful of levels deep; anything past this is garbage
// or an attack on the stack.
const MAX_DEPTH: usize = 64;

/// A decoded bencode value. Dictionaries keep the key order of the source
/// bytes; [`encode`] re-emits them in canonical (byte-lexicographic) order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(Vec<(Vec<u8>, Value)>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn lookup(&self, key: &[u8]) -> Option<&Value> {
        match self {
            Value::Dict(pairs) => pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }
}

/// A decoded value annotated with the byte range it occupied in the input.
/// `info_hash` is defined over the source encoding of the `info` dictionary,
/// so that slice must survive decoding untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub value: NodeValue,
    pub span: Range<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeValue {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Node>),
    Dict(Vec<(Vec<u8>, Node)>),
}

impl Node {
    pub fn lookup(&self, key: &[u8]) -> Option<&Node> {
        match &self.value {
            NodeValue::Dict(pairs) => pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn into_value(self) -> Value {
        match self.value {
            NodeValue::Int(n) => Value::Int(n),
            NodeValue::Bytes(b) => Value::Bytes(b),
            NodeValue::List(items) => {
                Value::List(items.into_iter().map(Node::into_value).collect())
            }
            NodeValue::Dict(pairs) => Value::Dict(
                pairs
                    .into_iter()
                    .map(|(k, v)| (k, v.into_value()))
                    .collect(),
            ),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("unexpected end of input at byte {0}")]
    UnexpectedEof(usize),
    #[error("invalid digit at byte {0}")]
    InvalidDigit(usize),
    #[error("leading zero in integer at byte {0}")]
    InvalidLeadingZero(usize),
    #[error("negative zero is not a valid integer (byte {0})")]
    NegativeZero(usize),
    #[error("integer at byte {0} does not fit in 64 bits")]
    IntOutOfRange(usize),
    #[error("byte string length at byte {0} runs past end of input")]
    LengthOverflow(usize),
    #[error("duplicate dictionary key {key:?} at byte {pos}")]
    DuplicateKey { pos: usize, key: Vec<u8> },
    #[error("dictionary keys out of order near {key:?}")]
    KeysOutOfOrder { key: Vec<u8> },
    #[error("trailing bytes after value at byte {0}")]
    TrailingBytes(usize),
    #[error("nesting deeper than {MAX_DEPTH} levels at byte {0}")]
    DepthExceeded(usize),
}

/// Decodes a complete bencoded document. Trailing bytes are an error.
pub fn decode(bytes: &[u8]) -> Result<Value, BencodeError> {
    decode_spanned(bytes).map(Node::into_value)
}

/// Like [`decode`], but every node carries its byte range in `bytes`.
pub fn decode_spanned(bytes: &[u8]) -> Result<Node, BencodeError> {
    let (node, end) = decode_at(bytes, 0, 0)?;
    if end != bytes.len() {
        return Err(BencodeError::TrailingBytes(end));
    }
    Ok(node)
}

fn decode_at(bytes: &[u8], pos: usize, depth: usize) -> Result<(Node, usize), BencodeError> {
    if depth >= MAX_DEPTH {
        return Err(BencodeError::DepthExceeded(pos));
    }
    match peek(bytes, pos)? {
        b'i' => {
            let (n, end) = decode_int(bytes, pos + 1, b'e')?;
            Ok((
                Node {
                    value: NodeValue::Int(n),
                    span: pos..end,
                },
                end,
            ))
        }
        b'l' => {
            let mut items = Vec::new();
            let mut cur = pos + 1;
            while peek(bytes, cur)? != b'e' {
                let (item, next) = decode_at(bytes, cur, depth + 1)?;
                items.push(item);
                cur = next;
            }
            Ok((
                Node {
                    value: NodeValue::List(items),
                    span: pos..cur + 1,
                },
                cur + 1,
            ))
        }
        b'd' => {
            let mut pairs: Vec<(Vec<u8>, Node)> = Vec::new();
            let mut cur = pos + 1;
            while peek(bytes, cur)? != b'e' {
                let key_pos = cur;
                let (key, after_key) = decode_bytes(bytes, cur)?;
                if pairs.iter().any(|(k, _)| *k == key) {
                    return Err(BencodeError::DuplicateKey { pos: key_pos, key });
                }
                let (val, next) = decode_at(bytes, after_key, depth + 1)?;
                pairs.push((key, val));
                cur = next;
            }
            Ok((
                Node {
                    value: NodeValue::Dict(pairs),
                    span: pos..cur + 1,
                },
                cur + 1,
            ))
        }
        b'0'..=b'9' => {
            let (s, end) = decode_bytes(bytes, pos)?;
            Ok((
                Node {
                    value: NodeValue::Bytes(s),
                    span: pos..end,
                },
                end,
            ))
        }
        _ => Err(BencodeError::InvalidDigit(pos)),
    }
}

// Parses the ASCII decimal run between `pos` and `delim`. Used for both
// integer bodies (delim 'e', sign allowed) and string lengths (delim ':').
fn decode_int(bytes: &[u8], pos: usize, delim: u8) -> Result<(i64, usize), BencodeError> {
    let mut cur = pos;
    let negative = if peek(bytes, cur)? == b'-' {
        if delim != b'e' {
            return Err(BencodeError::InvalidDigit(cur));
        }
        cur += 1;
        true
    } else {
        false
    };
    let digits_start = cur;
    while peek(bytes, cur)?.is_ascii_digit() {
        cur += 1;
    }
    if cur == digits_start {
        return Err(BencodeError::InvalidDigit(cur));
    }
    if peek(bytes, cur)? != delim {
        return Err(BencodeError::InvalidDigit(cur));
    }
    let digits = &bytes[digits_start..cur];
    if digits.len() > 1 && digits[0] == b'0' {
        return Err(BencodeError::InvalidLeadingZero(digits_start));
    }
    if negative && digits == b"0" {
        return Err(BencodeError::NegativeZero(pos));
    }
    let mut n: i64 = 0;
    for &d in digits {
        n = n
            .checked_mul(10)
            .and_then(|n| {
                if negative {
                    n.checked_sub(i64::from(d - b'0'))
                } else {
                    n.checked_add(i64::from(d - b'0'))
                }
            })
            .ok_or(BencodeError::IntOutOfRange(pos))?;
    }
    Ok((n, cur + 1))
}

fn decode_bytes(bytes: &[u8], pos: usize) -> Result<(Vec<u8>, usize), BencodeError> {
    if !peek(bytes, pos)?.is_ascii_digit() {
        return Err(BencodeError::InvalidDigit(pos));
    }
    let (len, data_start) = decode_int(bytes, pos, b':')?;
    let len = len as usize;
    if data_start + len > bytes.len() {
        return Err(BencodeError::LengthOverflow(pos));
    }
    Ok((bytes[data_start..data_start + len].to_vec(), data_start + len))
}

fn peek(bytes: &[u8], pos: usize) -> Result<u8, BencodeError> {
    bytes
        .get(pos)
        .copied()
        .ok_or(BencodeError::UnexpectedEof(pos))
}

/// Canonical encoding: dictionary keys are emitted sorted by raw bytes
/// regardless of the order held in the `Value`.
pub fn encode(value: &Value) -> Result<Vec<u8>, BencodeError> {
    let mut out = Vec::new();
    encode_value(&mut out, value, true)?;
    Ok(out)
}

/// Encodes dictionaries in their held order and errors with
/// [`BencodeError::KeysOutOfOrder`] when that order is not canonical.
/// Round-trip checks use this to prove a source document was canonical.
pub fn encode_checked(value: &Value) -> Result<Vec<u8>, BencodeError> {
    let mut out = Vec::new();
    encode_value(&mut out, value, false)?;
    Ok(out)
}

fn encode_value(out: &mut Vec<u8>, value: &Value, sort: bool) -> Result<(), BencodeError> {
    match value {
        Value::Int(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(b) => encode_bytes(out, b),
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_value(out, item, sort)?;
            }
            out.push(b'e');
        }
        Value::Dict(pairs) => {
            out.push(b'd');
            let mut ordered: Vec<&(Vec<u8>, Value)> = pairs.iter().collect();
            if sort {
                ordered.sort_by(|a, b| a.0.cmp(&b.0));
            }
            for window in ordered.windows(2) {
                if window[0].0 >= window[1].0 {
                    return Err(BencodeError::KeysOutOfOrder {
                        key: window[1].0.clone(),
                    });
                }
            }
            for (key, val) in ordered {
                encode_bytes(out, key);
                encode_value(out, val, sort)?;
            }
            out.push(b'e');
        }
    }
    Ok(())
}

fn encode_bytes(out: &mut Vec<u8>, b: &[u8]) {
    out.extend_from_slice(b.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(b);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_mixed_dict() {
        let input = b"d3:cow3:moo4:spaml1:a1:bee";
        let value = decode(input).unwrap();
        assert_eq!(
            value,
            Value::Dict(vec![
                (b"cow".to_vec(), Value::Bytes(b"moo".to_vec())),
                (
                    b"spam".to_vec(),
                    Value::List(vec![
                        Value::Bytes(b"a".to_vec()),
                        Value::Bytes(b"b".to_vec()),
                    ]),
                ),
            ])
        );
        assert_eq!(encode(&value).unwrap(), input.to_vec());
    }

    #[test]
    fn integer_edge_cases() {
        assert_eq!(decode(b"i0e").unwrap(), Value::Int(0));
        assert_eq!(decode(b"i-42e").unwrap(), Value::Int(-42));
        assert_eq!(decode(b"i-0e"), Err(BencodeError::NegativeZero(1)));
        assert_eq!(decode(b"i03e"), Err(BencodeError::InvalidLeadingZero(1)));
        assert!(matches!(
            decode(b"i9223372036854775808e"),
            Err(BencodeError::IntOutOfRange(_))
        ));
    }

    #[test]
    fn truncated_inputs() {
        assert_eq!(decode(b"i42"), Err(BencodeError::UnexpectedEof(3)));
        assert_eq!(decode(b"4:spa"), Err(BencodeError::LengthOverflow(0)));
        assert_eq!(decode(b"l1:a"), Err(BencodeError::UnexpectedEof(4)));
        assert_eq!(decode(b""), Err(BencodeError::UnexpectedEof(0)));
    }

    #[test]
    fn trailing_garbage_rejected() {
        assert_eq!(decode(b"i42ei0e"), Err(BencodeError::TrailingBytes(4)));
        assert_eq!(decode(b"3:food"), Err(BencodeError::TrailingBytes(5)));
    }

    #[test]
    fn duplicate_keys_rejected() {
        assert_eq!(
            decode(b"d1:ai1e1:ai2ee"),
            Err(BencodeError::DuplicateKey {
                pos: 7,
                key: b"a".to_vec(),
            })
        );
    }

    #[test]
    fn unsorted_dict_decodes_but_checked_encode_fails() {
        let input = b"d4:spami1e3:cowi2ee";
        let value = decode(input).unwrap();
        assert_eq!(
            encode_checked(&value),
            Err(BencodeError::KeysOutOfOrder {
                key: b"cow".to_vec(),
            })
        );
        // canonical encode re-sorts
        assert_eq!(encode(&value).unwrap(), b"d3:cowi2e4:spami1ee".to_vec());
    }

    #[test]
    fn spans_cover_source_slices() {
        let input = b"d4:infod6:lengthi20eee";
        let root = decode_spanned(input).unwrap();
        assert_eq!(root.span, 0..input.len());
        let info = root.lookup(b"info").unwrap();
        assert_eq!(&input[info.span.clone()], b"d6:lengthi20ee");
    }

    #[test]
    fn span_survives_noncanonical_order() {
        // keys deliberately out of canonical order inside info
        let input = b"d4:infod4:zzzzi1e4:aaaai2eee";
        let root = decode_spanned(input).unwrap();
        let info = root.lookup(b"info").unwrap();
        assert_eq!(&input[info.span.clone()], b"d4:zzzzi1e4:aaaai2ee");
    }

    #[test]
    fn depth_cap() {
        let mut input = Vec::new();
        input.extend(std::iter::repeat_n(b'l', 80));
        input.extend(std::iter::repeat_n(b'e', 80));
        assert!(matches!(
            decode(&input),
            Err(BencodeError::DepthExceeded(_))
        ));
    }

    #[test]
    fn empty_string_and_list() {
        assert_eq!(decode(b"0:").unwrap(), Value::Bytes(Vec::new()));
        assert_eq!(decode(b"le").unwrap(), Value::List(Vec::new()));
        assert_eq!(decode(b"de").unwrap(), Value::Dict(Vec::new()));
    }
}
