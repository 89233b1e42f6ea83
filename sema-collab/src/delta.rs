//! Rich-text operation logs ("deltas") and their composition algebra.
//!
//! A delta is an ordered list of runs, each one of:
//!
//! ```text
//! ┌──────────────────────────────┬───────────────────────────────────┐
//! │ {"insert": "Hi", attributes} │ insert text (or a length-1 embed) │
//! │ {"retain": 3,    attributes} │ keep 3 units, optionally restyle  │
//! │ {"delete": 2}                │ remove 2 units                    │
//! └──────────────────────────────┴───────────────────────────────────┘
//! ```
//!
//! A delta made only of inserts is a *document*: the full content of a field.
//! Applying a change to a document is `document.compose(&change)`.
//!
//! Lengths are counted in UTF-16 code units so that positions agree with
//! browser-based editor peers sharing the same channel.
//!
//! Reference: Quill Delta format (quilljs/delta), `compose` semantics.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Formatting attributes attached to a run (`bold`, `italic`, `link`, …).
///
/// On a retain, a `null` value removes the attribute from the retained range.
pub type Attributes = Map<String, Value>;

/// Errors raised when a change cannot be applied to a document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeltaError {
    #[error("change spans {base_len} units but the document is only {doc_len} long")]
    OutOfRange { base_len: usize, doc_len: usize },

    #[error("content is not a document (contains retain or delete runs)")]
    NotADocument,

    #[error("change splits a surrogate pair at offset {offset}")]
    SplitCharacter { offset: usize },
}

// ───────────────────────────────────────────────────────────────────
// Runs
// ───────────────────────────────────────────────────────────────────

/// Inserted content: a text run or a single embed (image, formula, …).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InsertValue {
    Text(String),
    Embed(Map<String, Value>),
}

impl InsertValue {
    /// Length in UTF-16 code units. Embeds always count as one.
    pub fn len(&self) -> usize {
        match self {
            InsertValue::Text(s) => utf16_len(s),
            InsertValue::Embed(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A single run of a delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawOp", into = "RawOp")]
pub enum Op {
    Insert {
        value: InsertValue,
        attributes: Option<Attributes>,
    },
    Retain {
        len: usize,
        attributes: Option<Attributes>,
    },
    Delete(usize),
}

impl Op {
    /// Length of the run in UTF-16 code units.
    pub fn len(&self) -> usize {
        match self {
            Op::Insert { value, .. } => value.len(),
            Op::Retain { len, .. } => *len,
            Op::Delete(len) => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn attributes(&self) -> Option<&Attributes> {
        match self {
            Op::Insert { attributes, .. } | Op::Retain { attributes, .. } => attributes.as_ref(),
            Op::Delete(_) => None,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, Op::Insert { .. })
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Op::Delete(_))
    }
}

/// Wire shape of a run: exactly one of `insert`, `retain`, `delete`.
#[derive(Serialize, Deserialize)]
struct RawOp {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    insert: Option<InsertValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retain: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delete: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    attributes: Option<Attributes>,
}

impl TryFrom<RawOp> for Op {
    type Error = String;

    fn try_from(raw: RawOp) -> Result<Self, Self::Error> {
        match (raw.insert, raw.retain, raw.delete) {
            (Some(value), None, None) => Ok(Op::Insert {
                value,
                attributes: normalize_attributes(raw.attributes, false),
            }),
            (None, Some(len), None) => Ok(Op::Retain {
                len,
                attributes: normalize_attributes(raw.attributes, true),
            }),
            (None, None, Some(len)) => Ok(Op::Delete(len)),
            (None, None, None) => Err("op has no insert, retain or delete".to_string()),
            _ => Err("op mixes insert, retain and delete".to_string()),
        }
    }
}

impl From<Op> for RawOp {
    fn from(op: Op) -> Self {
        match op {
            Op::Insert { value, attributes } => RawOp {
                insert: Some(value),
                retain: None,
                delete: None,
                attributes,
            },
            Op::Retain { len, attributes } => RawOp {
                insert: None,
                retain: Some(len),
                delete: None,
                attributes,
            },
            Op::Delete(len) => RawOp {
                insert: None,
                retain: None,
                delete: Some(len),
                attributes: None,
            },
        }
    }
}

/// Empty maps become `None`; nulls are dropped unless they carry meaning.
fn normalize_attributes(attributes: Option<Attributes>, keep_null: bool) -> Option<Attributes> {
    let mut attributes = attributes?;
    if !keep_null {
        attributes.retain(|_, v| !v.is_null());
    }
    (!attributes.is_empty()).then_some(attributes)
}

// ───────────────────────────────────────────────────────────────────
// Delta
// ───────────────────────────────────────────────────────────────────

/// An operation log. Serialized as `{"ops": [...]}`.
///
/// Always held in canonical form: no zero-length runs, adjacent runs of the
/// same kind and attributes merged, inserts ordered before an adjacent delete.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DeltaWire")]
pub struct Delta {
    ops: Vec<Op>,
}

#[derive(Deserialize)]
struct DeltaWire {
    #[serde(default)]
    ops: Vec<Op>,
}

impl TryFrom<DeltaWire> for Delta {
    type Error = String;

    /// Rejects run lists whose lengths do not fit in `usize`.
    fn try_from(wire: DeltaWire) -> Result<Self, Self::Error> {
        let mut base = 0usize;
        let mut target = 0usize;
        for op in &wire.ops {
            let (b, t) = match op {
                Op::Insert { value, .. } => (0, value.len()),
                Op::Retain { len, .. } => (*len, *len),
                Op::Delete(len) => (*len, 0),
            };
            base = base
                .checked_add(b)
                .ok_or_else(|| "delta base length overflows".to_string())?;
            target = target
                .checked_add(t)
                .ok_or_else(|| "delta target length overflows".to_string())?;
        }
        Ok(Delta::from_ops(wire.ops))
    }
}

impl Delta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a canonical delta from arbitrary runs.
    pub fn from_ops(ops: impl IntoIterator<Item = Op>) -> Self {
        let mut delta = Delta::new();
        for op in ops {
            delta.push(op);
        }
        delta
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<Op> {
        self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Append plain text.
    pub fn insert(self, text: impl Into<String>) -> Self {
        self.insert_with(text, None)
    }

    /// Append formatted text.
    pub fn insert_with(mut self, text: impl Into<String>, attributes: Option<Attributes>) -> Self {
        self.push(Op::Insert {
            value: InsertValue::Text(text.into()),
            attributes: normalize_attributes(attributes, false),
        });
        self
    }

    /// Append an embed such as `{"image": "https://…"}`.
    pub fn insert_embed(mut self, embed: Map<String, Value>, attributes: Option<Attributes>) -> Self {
        self.push(Op::Insert {
            value: InsertValue::Embed(embed),
            attributes: normalize_attributes(attributes, false),
        });
        self
    }

    pub fn retain(self, len: usize) -> Self {
        self.retain_with(len, None)
    }

    pub fn retain_with(mut self, len: usize, attributes: Option<Attributes>) -> Self {
        self.push(Op::Retain {
            len,
            attributes: normalize_attributes(attributes, true),
        });
        self
    }

    pub fn delete(mut self, len: usize) -> Self {
        self.push(Op::Delete(len));
        self
    }

    /// Append a run, keeping the delta canonical.
    pub fn push(&mut self, op: Op) {
        if op.is_empty() {
            return;
        }

        if let (Some(Op::Delete(last)), Op::Delete(len)) = (self.ops.last_mut(), &op) {
            *last = last.saturating_add(*len);
            return;
        }

        let mut index = self.ops.len();
        // An insert directly after a delete goes before it.
        if op.is_insert() && self.ops.last().is_some_and(Op::is_delete) {
            index -= 1;
            if index == 0 {
                self.ops.insert(0, op);
                return;
            }
        }

        if index > 0 {
            let prev = &mut self.ops[index - 1];
            if prev.attributes() == op.attributes() {
                match (prev, &op) {
                    (
                        Op::Insert { value: InsertValue::Text(a), .. },
                        Op::Insert { value: InsertValue::Text(b), .. },
                    ) => {
                        a.push_str(b);
                        return;
                    }
                    (Op::Retain { len: a, .. }, Op::Retain { len: b, .. }) => {
                        *a = a.saturating_add(*b);
                        return;
                    }
                    _ => {}
                }
            }
        }

        self.ops.insert(index, op);
    }

    /// Drop a trailing unformatted retain (it is implied).
    pub fn chop(mut self) -> Self {
        if let Some(Op::Retain { attributes: None, .. }) = self.ops.last() {
            self.ops.pop();
        }
        self
    }

    /// Units of the base document this delta reads (retains + deletes).
    ///
    /// Saturates at `usize::MAX`, which no document can satisfy.
    pub fn base_len(&self) -> usize {
        self.ops.iter().fold(0usize, |acc, op| match op {
            Op::Retain { len, .. } | Op::Delete(len) => acc.saturating_add(*len),
            Op::Insert { .. } => acc,
        })
    }

    /// Units produced after applying this delta (inserts + retains).
    pub fn target_len(&self) -> usize {
        self.ops.iter().fold(0usize, |acc, op| match op {
            Op::Insert { value, .. } => acc.saturating_add(value.len()),
            Op::Retain { len, .. } => acc.saturating_add(*len),
            Op::Delete(_) => acc,
        })
    }

    /// First position where `change` would cut one of this document's
    /// surrogate pairs in half, if any.
    pub fn split_point(&self, change: &Delta) -> Option<usize> {
        let mut inside = Vec::new();
        let mut pos = 0usize;
        for op in &self.ops {
            match op {
                Op::Insert { value: InsertValue::Text(s), .. } => {
                    for ch in s.chars() {
                        if ch.len_utf16() == 2 {
                            inside.push(pos + 1);
                        }
                        pos += ch.len_utf16();
                    }
                }
                other => pos = pos.saturating_add(other.len()),
            }
        }
        if inside.is_empty() {
            return None;
        }

        let mut cursor = 0usize;
        for op in &change.ops {
            if let Op::Retain { len, .. } | Op::Delete(len) = op {
                cursor = cursor.saturating_add(*len);
                if inside.binary_search(&cursor).is_ok() {
                    return Some(cursor);
                }
            }
        }
        None
    }

    /// Whether this delta is a document (inserts only).
    pub fn is_document(&self) -> bool {
        self.ops.iter().all(Op::is_insert)
    }

    /// Text content with each embed rendered as U+FFFC.
    pub fn plain_text(&self) -> String {
        let mut text = String::new();
        for op in &self.ops {
            match op {
                Op::Insert { value: InsertValue::Text(s), .. } => text.push_str(s),
                Op::Insert { value: InsertValue::Embed(_), .. } => text.push('\u{FFFC}'),
                _ => {}
            }
        }
        text
    }

    /// Compose `self` followed by `other` into one equivalent delta.
    ///
    /// Positions in `other` past the end of `self` behave as if `self`
    /// ended in an infinite retain; callers that need strict bounds check
    /// `other.base_len()` first.
    pub fn compose(&self, other: &Delta) -> Delta {
        let mut this_iter = OpIter::new(&self.ops);
        let mut other_iter = OpIter::new(&other.ops);
        let mut out = Delta::new();

        while this_iter.has_next() || other_iter.has_next() {
            if other_iter.peek_is_insert() {
                out.push(other_iter.next(usize::MAX));
            } else if this_iter.peek_is_delete() {
                out.push(this_iter.next(usize::MAX));
            } else {
                let length = this_iter.peek_len().min(other_iter.peek_len());
                let this_op = this_iter.next(length);
                let other_op = other_iter.next(length);

                match other_op {
                    Op::Retain { attributes: other_attrs, .. } => {
                        let composed = match this_op {
                            Op::Retain { attributes, .. } => Op::Retain {
                                len: length,
                                attributes: compose_attributes(
                                    attributes.as_ref(),
                                    other_attrs.as_ref(),
                                    true,
                                ),
                            },
                            Op::Insert { value, attributes } => Op::Insert {
                                value,
                                attributes: compose_attributes(
                                    attributes.as_ref(),
                                    other_attrs.as_ref(),
                                    false,
                                ),
                            },
                            Op::Delete(_) => continue,
                        };
                        out.push(composed);
                    }
                    Op::Delete(len) => {
                        // Deleting freshly inserted content cancels out.
                        if matches!(this_op, Op::Retain { .. }) {
                            out.push(Op::Delete(len));
                        }
                    }
                    Op::Insert { .. } => {}
                }
            }
        }

        out.chop()
    }
}

/// Attributes of `b` layered over `a`.
fn compose_attributes(
    a: Option<&Attributes>,
    b: Option<&Attributes>,
    keep_null: bool,
) -> Option<Attributes> {
    let mut out = b.cloned().unwrap_or_default();
    if !keep_null {
        out.retain(|_, v| !v.is_null());
    }
    if let Some(a) = a {
        for (key, value) in a {
            if !b.is_some_and(|b| b.contains_key(key)) {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    (!out.is_empty()).then_some(out)
}

// ───────────────────────────────────────────────────────────────────
// Iteration
// ───────────────────────────────────────────────────────────────────

/// Walks a run list, handing out pieces of at most a requested length.
/// Past the end it yields an unbounded retain.
struct OpIter<'a> {
    ops: &'a [Op],
    index: usize,
    offset: usize,
}

impl<'a> OpIter<'a> {
    fn new(ops: &'a [Op]) -> Self {
        Self { ops, index: 0, offset: 0 }
    }

    fn has_next(&self) -> bool {
        self.index < self.ops.len()
    }

    fn peek_len(&self) -> usize {
        match self.ops.get(self.index) {
            Some(op) => op.len() - self.offset,
            None => usize::MAX,
        }
    }

    fn peek_is_insert(&self) -> bool {
        self.ops.get(self.index).is_some_and(Op::is_insert)
    }

    fn peek_is_delete(&self) -> bool {
        self.ops.get(self.index).is_some_and(Op::is_delete)
    }

    fn next(&mut self, length: usize) -> Op {
        let Some(op) = self.ops.get(self.index) else {
            return Op::Retain { len: usize::MAX, attributes: None };
        };

        let offset = self.offset;
        let remaining = op.len() - offset;
        let length = length.min(remaining);
        if length == remaining {
            self.index += 1;
            self.offset = 0;
        } else {
            self.offset += length;
        }

        match op {
            Op::Delete(_) => Op::Delete(length),
            Op::Retain { attributes, .. } => Op::Retain {
                len: length,
                attributes: attributes.clone(),
            },
            Op::Insert { value: InsertValue::Text(s), attributes } => Op::Insert {
                value: InsertValue::Text(utf16_slice(s, offset, length)),
                attributes: attributes.clone(),
            },
            Op::Insert { value, attributes } => Op::Insert {
                value: value.clone(),
                attributes: attributes.clone(),
            },
        }
    }
}

fn utf16_len(s: &str) -> usize {
    s.chars().map(char::len_utf16).sum()
}

fn utf16_slice(s: &str, start: usize, len: usize) -> String {
    let end = start + len;
    let mut pos = 0;
    let mut out = String::new();
    for ch in s.chars() {
        if pos >= end {
            break;
        }
        if pos >= start {
            out.push(ch);
        }
        pos += ch.len_utf16();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(v: Value) -> Option<Attributes> {
        v.as_object().cloned()
    }

    #[test]
    fn test_push_merges_adjacent_inserts() {
        let delta = Delta::new().insert("Hel").insert("lo");
        assert_eq!(delta.ops().len(), 1);
        assert_eq!(delta.plain_text(), "Hello");
    }

    #[test]
    fn test_push_keeps_differently_formatted_runs() {
        let delta = Delta::new()
            .insert("a")
            .insert_with("b", attrs(json!({"bold": true})));
        assert_eq!(delta.ops().len(), 2);
    }

    #[test]
    fn test_push_orders_insert_before_delete() {
        let delta = Delta::new().retain(2).delete(1).insert("x");
        assert_eq!(
            delta.ops(),
            Delta::new().retain(2).insert("x").delete(1).ops()
        );
    }

    #[test]
    fn test_push_skips_empty_runs() {
        let delta = Delta::new().retain(0).insert("").delete(0);
        assert!(delta.is_empty());
    }

    #[test]
    fn test_compose_insert_into_document() {
        let doc = Delta::new().insert("Hello");
        let change = Delta::new().retain(5).insert(" world");
        assert_eq!(doc.compose(&change).plain_text(), "Hello world");
    }

    #[test]
    fn test_compose_delete_from_document() {
        let doc = Delta::new().insert("Hello world");
        let change = Delta::new().retain(5).delete(6);
        let out = doc.compose(&change);
        assert_eq!(out, Delta::new().insert("Hello"));
        assert!(out.is_document());
    }

    #[test]
    fn test_compose_retain_applies_formatting() {
        let doc = Delta::new().insert("Hello");
        let change = Delta::new().retain_with(2, attrs(json!({"bold": true})));
        let out = doc.compose(&change);
        assert_eq!(
            out,
            Delta::new()
                .insert_with("He", attrs(json!({"bold": true})))
                .insert("llo")
        );
    }

    #[test]
    fn test_compose_null_attribute_removes_format() {
        let doc = Delta::new().insert_with("Hi", attrs(json!({"bold": true, "italic": true})));
        let change = Delta::new().retain_with(2, attrs(json!({"bold": null})));
        let out = doc.compose(&change);
        assert_eq!(out, Delta::new().insert_with("Hi", attrs(json!({"italic": true}))));
    }

    #[test]
    fn test_compose_changes_keeps_delete_after_retain() {
        let a = Delta::new().retain(3).insert("x");
        let b = Delta::new().retain(4).delete(2);
        let composed = a.compose(&b);
        assert_eq!(composed, Delta::new().retain(3).insert("x").delete(2));
    }

    #[test]
    fn test_compose_insert_then_delete_cancels() {
        let a = Delta::new().insert("abc");
        let b = Delta::new().delete(3);
        assert!(a.compose(&b).is_empty());
    }

    #[test]
    fn test_base_and_target_len() {
        let change = Delta::new().retain(3).insert("xy").delete(4);
        assert_eq!(change.base_len(), 7);
        assert_eq!(change.target_len(), 5);
        assert!(!change.is_document());
    }

    #[test]
    fn test_utf16_lengths() {
        // U+1F600 is a surrogate pair in UTF-16.
        let doc = Delta::new().insert("a\u{1F600}b");
        assert_eq!(doc.target_len(), 4);
        let out = doc.compose(&Delta::new().retain(3).delete(1));
        assert_eq!(out.plain_text(), "a\u{1F600}");
    }

    #[test]
    fn test_split_point_finds_cut_surrogate() {
        let doc = Delta::new().insert("a\u{1F600}b");
        assert_eq!(doc.split_point(&Delta::new().retain(2).insert("x")), Some(2));
        assert_eq!(doc.split_point(&Delta::new().retain(1).delete(1)), Some(2));
        assert_eq!(doc.split_point(&Delta::new().retain(1).delete(2)), None);
        assert_eq!(doc.split_point(&Delta::new().retain(3).insert("x")), None);
    }

    #[test]
    fn test_lengths_saturate_instead_of_overflowing() {
        let change = Delta::from_ops([
            Op::Retain { len: usize::MAX, attributes: None },
            Op::Insert { value: InsertValue::Text("x".into()), attributes: None },
            Op::Delete(5),
        ]);
        assert_eq!(change.base_len(), usize::MAX);
        assert_eq!(change.target_len(), usize::MAX);

        let merged = Delta::new().retain(usize::MAX).retain(5);
        assert_eq!(merged.base_len(), usize::MAX);
    }

    #[test]
    fn test_parse_rejects_overflowing_lengths() {
        let result: Result<Delta, _> = serde_json::from_value(json!({
            "ops": [{"retain": u64::MAX}, {"retain": 5}]
        }));
        assert!(result.is_err());
        let result: Result<Delta, _> = serde_json::from_value(json!({
            "ops": [{"delete": u64::MAX}, {"delete": 1}]
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_embed_counts_as_one() {
        let embed = json!({"image": "https://example.com/a.png"});
        let doc = Delta::new()
            .insert("a")
            .insert_embed(embed.as_object().cloned().unwrap_or_default(), None)
            .insert("b");
        assert_eq!(doc.target_len(), 3);
        assert_eq!(doc.plain_text(), "a\u{FFFC}b");
    }

    #[test]
    fn test_wire_format() {
        let delta = Delta::new()
            .insert_with("Hi", attrs(json!({"bold": true})))
            .retain(3)
            .delete(2);
        let value = serde_json::to_value(&delta).unwrap();
        assert_eq!(
            value,
            json!({"ops": [
                {"insert": "Hi", "attributes": {"bold": true}},
                {"retain": 3},
                {"delete": 2}
            ]})
        );
    }

    #[test]
    fn test_parse_strips_null_insert_attributes() {
        // Stored deltas may carry `"list": null` on plain inserts.
        let delta: Delta = serde_json::from_value(json!({
            "ops": [{"insert": "x", "attributes": {"list": null}}]
        }))
        .unwrap();
        assert_eq!(delta, Delta::new().insert("x"));
    }

    #[test]
    fn test_parse_canonicalizes() {
        let delta: Delta = serde_json::from_value(json!({
            "ops": [{"insert": "a"}, {"insert": "b"}, {"retain": 0}]
        }))
        .unwrap();
        assert_eq!(delta, Delta::new().insert("ab"));
    }

    #[test]
    fn test_parse_rejects_ambiguous_op() {
        let result: Result<Delta, _> =
            serde_json::from_value(json!({"ops": [{"insert": "a", "delete": 1}]}));
        assert!(result.is_err());
        let result: Result<Delta, _> = serde_json::from_value(json!({"ops": [{}]}));
        assert!(result.is_err());
    }
}
