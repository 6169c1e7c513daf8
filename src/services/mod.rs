//! Service layer: the download pipeline behind the thin front-ends.

pub mod download;
