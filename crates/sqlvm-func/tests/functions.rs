use proptest::prelude::*;
use sqlvm_error::Result;
use sqlvm_func::{FunctionContext, FunctionRegistry, ScalarFunction};
use sqlvm_types::{CollSeq, SqlValue};

struct Reverse;

impl ScalarFunction for Reverse {
    fn invoke(&self, ctx: &mut FunctionContext<'_>) -> Result<()> {
        if let SqlValue::Text(s) = ctx.arg(0) {
            let out: String = s.chars().rev().collect();
            ctx.set_result(out);
        }
        Ok(())
    }

    fn num_args(&self) -> i32 {
        1
    }

    fn name(&self) -> &str {
        "reverse"
    }
}

fn call(registry: &FunctionRegistry, name: &str, args: &[SqlValue], coll: Option<&CollSeq>) -> SqlValue {
    let arity = i32::try_from(args.len()).unwrap();
    let f = registry.find_scalar(name, arity).unwrap();
    let mut ctx = FunctionContext::new(args, coll, 1_000_000);
    f.invoke(&mut ctx).unwrap();
    ctx.finish().unwrap()
}

#[test]
fn test_user_function_alongside_builtins() {
    let mut registry = FunctionRegistry::with_builtins();
    registry.register_scalar(Reverse);
    let out = call(&registry, "REVERSE", &[SqlValue::from("abc")], None);
    assert_eq!(out, SqlValue::from("cba"));
}

#[test]
fn test_collation_reaches_scalar_function() {
    let registry = FunctionRegistry::with_builtins();
    let args = [SqlValue::from("ABC"), SqlValue::from("abc")];
    assert_eq!(call(&registry, "nullif", &args, None), SqlValue::from("ABC"));
    let nocase = CollSeq::nocase();
    assert!(call(&registry, "nullif", &args, Some(&nocase)).is_null());
}

proptest! {
    #[test]
    fn prop_substr_stays_inside_input(s in "[a-z]{0,12}", start in -20i64..20, len in -20i64..20) {
        let registry = FunctionRegistry::with_builtins();
        let out = call(
            &registry,
            "substr",
            &[SqlValue::Text(s.clone()), SqlValue::Integer(start), SqlValue::Integer(len)],
            None,
        );
        let SqlValue::Text(out) = out else {
            return Err(TestCaseError::fail("substr of text must be text"));
        };
        prop_assert!(out.len() <= s.len());
        prop_assert!(s.contains(&out));
    }
}
