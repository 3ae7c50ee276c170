mod headers;
pub use headers::{HeaderContract, HeaderContractLayer};

mod json;
pub use json::{JsonLayer, JsonService};
