//! Typed host-function registration.
//!
//! A host function is a `FunctionType` plus a thunk that marshals operands
//! between the guest ABI and native types. The marshalling is
//! monomorphised per signature at registration time by the
//! [`IntoHostFunc`] impls below; nothing is reflected at call time.

use crate::runtime::{Function, Trap, Value};
use crate::types::{FunctionType, TypeTuple, ValueType};

/// A native type with a direct wasm value representation.
pub trait WasmTy: Sized + Copy + Send + Sync + 'static {
    const VALUE_TYPE: ValueType;
    fn from_value(value: Value) -> Self;
    fn into_value(self) -> Value;
}

macro_rules! impl_wasm_ty {
    ($native:ty, $value_type:ident, $variant:ident, $from:expr, $into:expr) => {
        impl WasmTy for $native {
            const VALUE_TYPE: ValueType = ValueType::$value_type;

            fn from_value(value: Value) -> Self {
                match value {
                    Value::$variant(v) => $from(v),
                    // The caller type-checks arguments against the
                    // signature before entering the thunk.
                    other => unreachable!("host argument type confusion: {other:?}"),
                }
            }

            fn into_value(self) -> Value {
                Value::$variant($into(self))
            }
        }
    };
}

impl_wasm_ty!(i32, I32, I32, |v| v, |v| v);
impl_wasm_ty!(u32, I32, I32, |v| v as u32, |v| v as i32);
impl_wasm_ty!(i64, I64, I64, |v| v, |v| v);
impl_wasm_ty!(u64, I64, I64, |v| v as u64, |v| v as i64);
impl_wasm_ty!(f32, F32, F32, |v| v, |v| v);
impl_wasm_ty!(f64, F64, F64, |v| v, |v| v);
impl_wasm_ty!(u128, V128, V128, |v| v, |v| v);

/// What a host closure may return: nothing, one value, or either wrapped
/// in `Result` so the host can raise a trap.
pub trait HostResult: Send + Sync + 'static {
    const TYPES: &'static [ValueType];
    fn into_values(self) -> Result<Vec<Value>, Trap>;
}

impl HostResult for () {
    const TYPES: &'static [ValueType] = &[];

    fn into_values(self) -> Result<Vec<Value>, Trap> {
        Ok(Vec::new())
    }
}

macro_rules! impl_host_result {
    ($($native:ty),*) => {
        $(
            impl HostResult for $native {
                const TYPES: &'static [ValueType] = &[<$native as WasmTy>::VALUE_TYPE];

                fn into_values(self) -> Result<Vec<Value>, Trap> {
                    Ok(vec![self.into_value()])
                }
            }

            impl HostResult for Result<$native, Trap> {
                const TYPES: &'static [ValueType] = &[<$native as WasmTy>::VALUE_TYPE];

                fn into_values(self) -> Result<Vec<Value>, Trap> {
                    self.map(|v| vec![v.into_value()])
                }
            }
        )*
    };
}

impl_host_result!(i32, u32, i64, u64, f32, f64, u128);

impl HostResult for Result<(), Trap> {
    const TYPES: &'static [ValueType] = &[];

    fn into_values(self) -> Result<Vec<Value>, Trap> {
        self.map(|()| Vec::new())
    }
}

/// Closures convertible into host [`Function`]s. The `Params`/`Results`
/// type parameters only drive inference; see [`Function::wrap`].
pub trait IntoHostFunc<Params, Results> {
    fn into_host_func(self) -> Function;
}

macro_rules! impl_into_host_func {
    ($($param:ident),*) => {
        impl<Func, $($param,)* R> IntoHostFunc<($($param,)*), R> for Func
        where
            Func: Fn($($param),*) -> R + Send + Sync + 'static,
            $($param: WasmTy,)*
            R: HostResult,
        {
            #[allow(non_snake_case, unused_variables, unused_mut)]
            fn into_host_func(self) -> Function {
                let params = TypeTuple::new(&[$(<$param as WasmTy>::VALUE_TYPE),*]);
                let results = TypeTuple::new(R::TYPES);
                let ty = FunctionType::new(results, params);
                Function::from_host(ty, move |args: &[Value]| {
                    let mut args = args.iter();
                    $( let $param = <$param as WasmTy>::from_value(*args.next().expect("arity checked by caller")); )*
                    (self)($($param),*).into_values()
                })
            }
        }
    };
}

impl_into_host_func!();
impl_into_host_func!(A);
impl_into_host_func!(A, B);
impl_into_host_func!(A, B, C);
impl_into_host_func!(A, B, C, D);
impl_into_host_func!(A, B, C, D, E);
impl_into_host_func!(A, B, C, D, E, F);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::TrapKind;

    #[test]
    fn wraps_a_typed_closure() {
        let func = Function::wrap(|a: i32, b: i32| a.wrapping_mul(b));
        assert_eq!(func.ty().to_string(), "(i32, i32)->i32");
        let results = func.invoke(&[Value::I32(6), Value::I32(7)]).unwrap();
        assert_eq!(results, vec![Value::I32(42)]);
    }

    #[test]
    fn host_closures_can_trap() {
        let func = Function::wrap(|n: i32| -> Result<i32, Trap> {
            if n < 0 {
                Err(Trap::new(TrapKind::InvalidArgument, "negative"))
            } else {
                Ok(n + 1)
            }
        });
        assert_eq!(func.invoke(&[Value::I32(1)]).unwrap(), vec![Value::I32(2)]);
        let err = func.invoke(&[Value::I32(-1)]).unwrap_err();
        assert_eq!(err.kind(), TrapKind::InvalidArgument);
    }

    #[test]
    fn argument_types_are_checked_at_the_boundary() {
        let func = Function::wrap(|_: i64| {});
        let err = func.invoke(&[Value::I32(0)]).unwrap_err();
        assert_eq!(err.kind(), TrapKind::InvalidArgument);
    }
}
