//! Ports to the external collaborators this crate treats as out of scope:
//! the conversion library and the NWB validation library.

pub mod conversion_library;
pub mod nwb_library;

pub use conversion_library::{
    ConversionLibraryPort, ConversionOutcome, ExtractedTechnicalMetadata, InterfaceCandidate,
    MockConversionLibrary,
};
pub use nwb_library::{MockNwbLibrary, NwbLibraryPort};
