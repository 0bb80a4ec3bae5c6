//! wyrm — an embeddable WebAssembly virtual machine.
//!
//! The pipeline: bytes are decoded into an immutable [`Module`] IR,
//! type-checked by the validator, lowered to threaded code by the
//! compiler, and instantiated inside a [`Compartment`] whose linear
//! memories are sandboxed behind guard pages.
//!
//! ```no_run
//! use wyrm::{Compartment, FeatureSpec, Linker, Value};
//!
//! let bytes = std::fs::read("module.wasm")?;
//! let module = wyrm::decode_and_validate(&bytes, FeatureSpec::default())?;
//! let compartment = Compartment::new();
//! let instance = wyrm::instantiate(&compartment, &module, &Linker::new())?;
//! let results = instance.invoke("add", &[Value::I32(2), Value::I32(3)])?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod binary;
pub mod compile;
pub mod features;
pub mod module;
pub mod operators;
pub mod print;
pub mod runtime;
mod trap_handler;
pub mod types;
pub mod validate;

pub use binary::{decode_module, encode_module, DecodeError};
pub use features::{Feature, FeatureSpec};
pub use module::Module;
pub use print::print_module;
pub use runtime::{
    instantiate, Compartment, Extern, Function, Global, Instance, InstantiationError,
    IntoHostFunc, LinkError, Linker, Memory, NamedLinker, Resolver, Table, Tag, Trap, TrapFrame,
    TrapKind, Value,
};
pub use validate::{validate_module, ValidationError};

/// Decode and validate in one step: the common path for trusted callers
/// that want a ready-to-instantiate module or a single error.
pub fn decode_and_validate(bytes: &[u8], features: FeatureSpec) -> Result<Module, Error> {
    let module = decode_module(bytes, features)?;
    validate_module(&module)?;
    Ok(module)
}

/// Any failure the pipeline can produce, for callers that do not need to
/// distinguish stages.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Instantiation(#[from] InstantiationError),
    #[error(transparent)]
    Trap(#[from] Trap),
}
