//! Empty crate body — this package exists only to host the `tests/`
//! integration suite in `tests/common` and the files alongside it.
