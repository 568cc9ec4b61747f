//! Built-in scalar functions.
//!
//! NULL in, NULL out unless a function says otherwise. Text is handled in
//! characters, blobs in bytes.
#![allow(
    clippy::unnecessary_literal_bound,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]

use std::cmp::Ordering;
use std::fmt::Write;

use sqlvm_error::{Result, SqlvmError};
use sqlvm_types::compare::compare_refs;
use sqlvm_types::SqlValue;

use crate::{FunctionContext, FunctionRegistry, ScalarFunction};

fn any_null(ctx: &FunctionContext<'_>) -> bool {
    ctx.args().iter().any(SqlValue::is_null)
}

/// Text form of a value as a string function sees it.
fn text_of(v: &SqlValue) -> String {
    match v {
        SqlValue::Blob(b) => String::from_utf8_lossy(b).into_owned(),
        other => other.to_text(),
    }
}

// ── abs(X) ────────────────────────────────────────────────────────────────

pub struct AbsFunc;

impl ScalarFunction for AbsFunc {
    fn invoke(&self, ctx: &mut FunctionContext<'_>) -> Result<()> {
        match ctx.arg(0) {
            SqlValue::Null => ctx.set_result(SqlValue::Null),
            SqlValue::Integer(i) => match i.checked_abs() {
                Some(v) => ctx.set_result(v),
                None => ctx.set_error("integer overflow"),
            },
            other => ctx.set_result(other.to_real().abs()),
        }
        Ok(())
    }

    fn num_args(&self) -> i32 {
        1
    }

    fn name(&self) -> &str {
        "abs"
    }
}

// ── coalesce / ifnull / nullif ────────────────────────────────────────────

pub struct CoalesceFunc;

impl ScalarFunction for CoalesceFunc {
    fn invoke(&self, ctx: &mut FunctionContext<'_>) -> Result<()> {
        let first = ctx.args().iter().find(|v| !v.is_null()).cloned();
        ctx.set_result(first.unwrap_or_default());
        Ok(())
    }

    fn num_args(&self) -> i32 {
        -1
    }

    fn name(&self) -> &str {
        "coalesce"
    }
}

pub struct IfnullFunc;

impl ScalarFunction for IfnullFunc {
    fn invoke(&self, ctx: &mut FunctionContext<'_>) -> Result<()> {
        let pick = if ctx.arg(0).is_null() { ctx.arg(1) } else { ctx.arg(0) };
        ctx.set_result(pick.clone());
        Ok(())
    }

    fn num_args(&self) -> i32 {
        2
    }

    fn name(&self) -> &str {
        "ifnull"
    }
}

pub struct NullifFunc;

impl ScalarFunction for NullifFunc {
    fn invoke(&self, ctx: &mut FunctionContext<'_>) -> Result<()> {
        let (a, b) = (ctx.arg(0), ctx.arg(1));
        let coll = ctx.collation();
        if compare_refs(a.as_value_ref(), b.as_value_ref(), Some(&coll)) == Ordering::Equal
            && !a.is_null()
            && !b.is_null()
        {
            ctx.set_result(SqlValue::Null);
        } else {
            ctx.set_result(a.clone());
        }
        Ok(())
    }

    fn num_args(&self) -> i32 {
        2
    }

    fn name(&self) -> &str {
        "nullif"
    }
}

// ── length / lower / upper / typeof / quote / hex ─────────────────────────

pub struct LengthFunc;

impl ScalarFunction for LengthFunc {
    fn invoke(&self, ctx: &mut FunctionContext<'_>) -> Result<()> {
        let len = match ctx.arg(0) {
            SqlValue::Null => None,
            SqlValue::Blob(b) => Some(b.len()),
            SqlValue::Text(s) => Some(s.chars().count()),
            other => Some(other.to_text().len()),
        };
        ctx.set_result(len.map(|n| n as i64));
        Ok(())
    }

    fn num_args(&self) -> i32 {
        1
    }

    fn name(&self) -> &str {
        "length"
    }
}

pub struct LowerFunc;

impl ScalarFunction for LowerFunc {
    fn invoke(&self, ctx: &mut FunctionContext<'_>) -> Result<()> {
        if !any_null(ctx) {
            let out = text_of(ctx.arg(0)).to_ascii_lowercase();
            ctx.set_result(out);
        }
        Ok(())
    }

    fn num_args(&self) -> i32 {
        1
    }

    fn name(&self) -> &str {
        "lower"
    }
}

pub struct UpperFunc;

impl ScalarFunction for UpperFunc {
    fn invoke(&self, ctx: &mut FunctionContext<'_>) -> Result<()> {
        if !any_null(ctx) {
            let out = text_of(ctx.arg(0)).to_ascii_uppercase();
            ctx.set_result(out);
        }
        Ok(())
    }

    fn num_args(&self) -> i32 {
        1
    }

    fn name(&self) -> &str {
        "upper"
    }
}

pub struct TypeofFunc;

impl ScalarFunction for TypeofFunc {
    fn invoke(&self, ctx: &mut FunctionContext<'_>) -> Result<()> {
        let name = ctx.arg(0).typeof_str();
        ctx.set_result(name);
        Ok(())
    }

    fn num_args(&self) -> i32 {
        1
    }

    fn name(&self) -> &str {
        "typeof"
    }
}

pub struct QuoteFunc;

impl ScalarFunction for QuoteFunc {
    fn invoke(&self, ctx: &mut FunctionContext<'_>) -> Result<()> {
        let literal = ctx.arg(0).to_string();
        ctx.set_result(literal);
        Ok(())
    }

    fn num_args(&self) -> i32 {
        1
    }

    fn name(&self) -> &str {
        "quote"
    }
}

pub struct HexFunc;

impl ScalarFunction for HexFunc {
    fn invoke(&self, ctx: &mut FunctionContext<'_>) -> Result<()> {
        let bytes = match ctx.arg(0) {
            SqlValue::Null => Vec::new(),
            SqlValue::Blob(b) => b.clone(),
            other => other.to_text().into_bytes(),
        };
        let mut out = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            let _ = write!(out, "{b:02X}");
        }
        ctx.set_result(out);
        Ok(())
    }

    fn num_args(&self) -> i32 {
        1
    }

    fn name(&self) -> &str {
        "hex"
    }
}

// ── substr(X, Y [, Z]) ────────────────────────────────────────────────────

/// Start and length of `substr` over a value of `len` units.
fn substr_window(len: i64, start: i64, count: Option<i64>) -> (usize, usize) {
    let mut p1 = start;
    let mut p2 = count.unwrap_or(i64::MAX / 2);
    let negative_len = p2 < 0;
    if negative_len {
        p2 = p2.saturating_neg();
    }
    if p1 < 0 {
        p1 += len;
        if p1 < 0 {
            p2 = (p2 + p1).max(0);
            p1 = 0;
        }
    } else if p1 > 0 {
        p1 -= 1;
    } else if p2 > 0 {
        p2 -= 1;
    }
    if negative_len {
        p1 -= p2;
        if p1 < 0 {
            p2 += p1;
            p1 = 0;
        }
    }
    let from = p1.clamp(0, len);
    let to = p1.saturating_add(p2).clamp(from, len);
    (from as usize, (to - from) as usize)
}

pub struct SubstrFunc;

impl ScalarFunction for SubstrFunc {
    fn invoke(&self, ctx: &mut FunctionContext<'_>) -> Result<()> {
        if any_null(ctx) {
            return Ok(());
        }
        let start = ctx.arg(1).to_integer();
        let count = (ctx.args().len() > 2).then(|| ctx.arg(2).to_integer());
        match ctx.arg(0) {
            SqlValue::Blob(b) => {
                let (from, n) = substr_window(b.len() as i64, start, count);
                ctx.set_result(b[from..from + n].to_vec());
            }
            other => {
                let text = text_of(other);
                let chars = text.chars().count() as i64;
                let (from, n) = substr_window(chars, start, count);
                let out: String = text.chars().skip(from).take(n).collect();
                ctx.set_result(out);
            }
        }
        Ok(())
    }

    fn num_args(&self) -> i32 {
        -1
    }

    fn name(&self) -> &str {
        "substr"
    }
}

// ── instr / replace ───────────────────────────────────────────────────────

pub struct InstrFunc;

impl ScalarFunction for InstrFunc {
    fn invoke(&self, ctx: &mut FunctionContext<'_>) -> Result<()> {
        if any_null(ctx) {
            return Ok(());
        }
        let pos = match (ctx.arg(0), ctx.arg(1)) {
            (SqlValue::Blob(hay), SqlValue::Blob(needle)) => {
                if needle.is_empty() {
                    Some(1)
                } else {
                    hay.windows(needle.len())
                        .position(|w| w == needle.as_slice())
                        .map(|i| i + 1)
                }
            }
            (hay, needle) => {
                let (hay, needle) = (text_of(hay), text_of(needle));
                hay.find(&needle).map(|byte| hay[..byte].chars().count() + 1)
            }
        };
        ctx.set_result(pos.map_or(0, |p| p as i64));
        Ok(())
    }

    fn num_args(&self) -> i32 {
        2
    }

    fn name(&self) -> &str {
        "instr"
    }
}

pub struct ReplaceFunc;

impl ScalarFunction for ReplaceFunc {
    fn invoke(&self, ctx: &mut FunctionContext<'_>) -> Result<()> {
        if any_null(ctx) {
            return Ok(());
        }
        let text = text_of(ctx.arg(0));
        let pattern = text_of(ctx.arg(1));
        if pattern.is_empty() {
            ctx.set_result(text);
            return Ok(());
        }
        let out = text.replace(&pattern, &text_of(ctx.arg(2)));
        if out.len() > ctx.max_length() {
            return Err(SqlvmError::TooBig);
        }
        ctx.set_result(out);
        Ok(())
    }

    fn num_args(&self) -> i32 {
        3
    }

    fn name(&self) -> &str {
        "replace"
    }
}

// ── min(X, ...) / max(X, ...) ─────────────────────────────────────────────

fn extreme(ctx: &mut FunctionContext<'_>, keep: Ordering) {
    if any_null(ctx) {
        return;
    }
    let coll = ctx.collation();
    let best = ctx.args().iter().reduce(|best, v| {
        if compare_refs(v.as_value_ref(), best.as_value_ref(), Some(&coll)) == keep {
            v
        } else {
            best
        }
    });
    ctx.set_result(best.cloned().unwrap_or_default());
}

pub struct MinFunc;

impl ScalarFunction for MinFunc {
    fn invoke(&self, ctx: &mut FunctionContext<'_>) -> Result<()> {
        extreme(ctx, Ordering::Less);
        Ok(())
    }

    fn num_args(&self) -> i32 {
        -1
    }

    fn name(&self) -> &str {
        "min"
    }
}

pub struct MaxFunc;

impl ScalarFunction for MaxFunc {
    fn invoke(&self, ctx: &mut FunctionContext<'_>) -> Result<()> {
        extreme(ctx, Ordering::Greater);
        Ok(())
    }

    fn num_args(&self) -> i32 {
        -1
    }

    fn name(&self) -> &str {
        "max"
    }
}

// ── random() / zeroblob(N) ────────────────────────────────────────────────

pub struct RandomFunc;

impl ScalarFunction for RandomFunc {
    fn invoke(&self, ctx: &mut FunctionContext<'_>) -> Result<()> {
        ctx.set_result(rand::random::<i64>());
        Ok(())
    }

    fn is_deterministic(&self) -> bool {
        false
    }

    fn num_args(&self) -> i32 {
        0
    }

    fn name(&self) -> &str {
        "random"
    }
}

pub struct ZeroblobFunc;

impl ScalarFunction for ZeroblobFunc {
    fn invoke(&self, ctx: &mut FunctionContext<'_>) -> Result<()> {
        let n = ctx.arg(0).to_integer().max(0);
        if n as u64 > ctx.max_length() as u64 {
            return Err(SqlvmError::TooBig);
        }
        ctx.set_result(vec![0u8; n as usize]);
        Ok(())
    }

    fn num_args(&self) -> i32 {
        1
    }

    fn name(&self) -> &str {
        "zeroblob"
    }
}

/// Register every built-in scalar function.
pub fn register_builtins(registry: &mut FunctionRegistry) {
    registry.register_scalar(AbsFunc);
    registry.register_scalar(CoalesceFunc);
    registry.register_scalar(IfnullFunc);
    registry.register_scalar(NullifFunc);
    registry.register_scalar(LengthFunc);
    registry.register_scalar(LowerFunc);
    registry.register_scalar(UpperFunc);
    registry.register_scalar(TypeofFunc);
    registry.register_scalar(QuoteFunc);
    registry.register_scalar(HexFunc);
    registry.register_scalar(SubstrFunc);
    registry.register_scalar(InstrFunc);
    registry.register_scalar(ReplaceFunc);
    registry.register_scalar(MinFunc);
    registry.register_scalar(MaxFunc);
    registry.register_scalar(RandomFunc);
    registry.register_scalar(ZeroblobFunc);
}
