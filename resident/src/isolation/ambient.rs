use std::collections::{BTreeMap, HashMap};

use crate::core::request::{ParamMap, UploadedFile};

///
/// An upload field as application code sees it. A single file stays `Flat`;
/// an indexed field is turned inside out so every attribute becomes its own
/// map keyed by the upload index.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileField {
    Flat(UploadedFile),
    Columnar(FileColumns),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileColumns {
    pub name: BTreeMap<String, String>,
    pub mime: BTreeMap<String, String>,
    pub tmp_name: BTreeMap<String, String>,
    pub size: BTreeMap<String, u64>,
    /// Only indexes whose upload reported an error code appear here.
    pub error: BTreeMap<String, i32>,
}

impl FileColumns {
    pub fn push(&mut self, index: &str, file: &UploadedFile) {
        self.name.insert(index.to_owned(), file.name.clone());
        self.mime.insert(index.to_owned(), file.mime.clone());
        self.tmp_name.insert(index.to_owned(), file.tmp_name.clone());
        self.size.insert(index.to_owned(), file.size);
        if let Some(code) = file.error {
            self.error.insert(index.to_owned(), code);
        }
    }
}

///
/// The per-request view of the transport data: query, form, cookies, server
/// metadata and uploads. It lives in a `RequestScope` and is filled by
/// `Isolator::prime`.
///
#[derive(Clone, Debug, Default)]
pub struct Ambient {
    pub get: ParamMap,
    pub post: ParamMap,
    pub cookie: HashMap<String, String>,
    /// Upper-cased keys, e.g. `REQUEST_METHOD`, `HTTP_USER_AGENT`.
    pub server: BTreeMap<String, String>,
    pub files: BTreeMap<String, FileField>,
}

impl Ambient {
    pub fn is_empty(&self) -> bool {
        self.get.is_empty()
            && self.post.is_empty()
            && self.cookie.is_empty()
            && self.server.is_empty()
            && self.files.is_empty()
    }

    pub fn clear(&mut self) {
        self.get.clear();
        self.post.clear();
        self.cookie.clear();
        self.server.clear();
        self.files.clear();
    }

    pub fn server_var(&self, name: &str) -> Option<&str> {
        self.server.get(name).map(String::as_str)
    }
}
