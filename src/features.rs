//! Feature flags gating decoding and validation.

/// A post-MVP feature that an opcode or construct may require.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    Threads,
    Simd,
    ExceptionHandling,
    ReferenceTypes,
    MultiValue,
    MultiMemory,
    BulkMemory,
    SignExtension,
    NonTrappingFloatToInt,
    TailCalls,
}

impl Feature {
    pub fn name(self) -> &'static str {
        match self {
            Feature::Threads => "threads",
            Feature::Simd => "simd",
            Feature::ExceptionHandling => "exception-handling",
            Feature::ReferenceTypes => "reference-types",
            Feature::MultiValue => "multi-value",
            Feature::MultiMemory => "multi-memory",
            Feature::BulkMemory => "bulk-memory",
            Feature::SignExtension => "sign-extension",
            Feature::NonTrappingFloatToInt => "non-trapping-float-to-int",
            Feature::TailCalls => "tail-calls",
        }
    }
}

/// The set of features a module is decoded and validated against.
///
/// An opcode or construct gated by a disabled feature is reported as
/// malformed, exactly as if the opcode did not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureSpec {
    pub threads: bool,
    pub simd: bool,
    pub exception_handling: bool,
    pub reference_types: bool,
    pub multi_value: bool,
    pub multi_memory: bool,
    pub bulk_memory: bool,
    pub sign_extension: bool,
    pub non_trapping_float_to_int: bool,
    pub tail_calls: bool,
}

impl Default for FeatureSpec {
    /// The default accepts the widely-shipped extensions and leaves the
    /// rest opt-in.
    fn default() -> Self {
        Self {
            threads: false,
            simd: false,
            exception_handling: false,
            reference_types: false,
            multi_value: true,
            multi_memory: false,
            bulk_memory: false,
            sign_extension: true,
            non_trapping_float_to_int: true,
            tail_calls: false,
        }
    }
}

impl FeatureSpec {
    /// Everything on.
    pub fn all() -> Self {
        Self {
            threads: true,
            simd: true,
            exception_handling: true,
            reference_types: true,
            multi_value: true,
            multi_memory: true,
            bulk_memory: true,
            sign_extension: true,
            non_trapping_float_to_int: true,
            tail_calls: true,
        }
    }

    /// The bare MVP.
    pub fn mvp() -> Self {
        Self {
            threads: false,
            simd: false,
            exception_handling: false,
            reference_types: false,
            multi_value: false,
            multi_memory: false,
            bulk_memory: false,
            sign_extension: false,
            non_trapping_float_to_int: false,
            tail_calls: false,
        }
    }

    pub fn supports(&self, feature: Feature) -> bool {
        match feature {
            Feature::Threads => self.threads,
            Feature::Simd => self.simd,
            Feature::ExceptionHandling => self.exception_handling,
            Feature::ReferenceTypes => self.reference_types,
            Feature::MultiValue => self.multi_value,
            Feature::MultiMemory => self.multi_memory,
            Feature::BulkMemory => self.bulk_memory,
            Feature::SignExtension => self.sign_extension,
            Feature::NonTrappingFloatToInt => self.non_trapping_float_to_int,
            Feature::TailCalls => self.tail_calls,
        }
    }
}
