pub mod ambient;
pub mod scope;

pub use self::ambient::{Ambient, FileColumns, FileField};
pub use self::scope::{ComponentCache, Event, EventRegistry, RequestScope, RouteState, WidgetStack};

use std::collections::BTreeMap;

use crate::core::request::{Request, Upload};
use crate::middleware::cookies::CookieValidator;

///
/// What a purge found and dropped. A purge of a scope that served a request
/// normally reports something; a second purge reports nothing.
///
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub listeners: usize,
    pub components: usize,
    pub route: bool,
    pub widgets: bool,
    pub ambient: bool,
}

impl PurgeReport {
    pub fn is_clean(&self) -> bool {
        self == &PurgeReport::default()
    }
}

///
/// Fills a `RequestScope` from a request before the application runs, and
/// empties it once the response has been sent.
///
pub struct Isolator {
    server_software: String,
    validator: Option<CookieValidator>,
}

impl Isolator {
    pub fn new(server_software: &str) -> Isolator {
        Isolator {
            server_software: server_software.to_owned(),
            validator: None,
        }
    }

    /// Only cookies carrying a valid signature reach the ambient state.
    pub fn with_validator(mut self, validator: Option<CookieValidator>) -> Isolator {
        self.validator = validator;
        self
    }

    ///
    /// Populate the scope's ambient state from `request`. Transport metadata
    /// keys are upper-cased, each header becomes `HTTP_<NAME>` and uploads are
    /// normalized by shape.
    ///
    pub fn prime(&self, request: &Request, scope: &mut RequestScope) {
        let ambient = &mut scope.ambient;
        ambient.clear();

        ambient.get = request.query.clone();
        ambient.post = request.post.clone();
        ambient.cookie = match self.validator {
            Some(ref validator) => request
                .cookies
                .iter()
                .filter_map(|(name, raw)| {
                    validator
                        .validate(name, raw)
                        .map(|value| (name.clone(), value))
                })
                .collect(),
            None => request.cookies.clone(),
        };

        for (key, value) in request.server.iter() {
            ambient.server.insert(key.to_ascii_uppercase(), value.clone());
        }
        for (name, value) in request.headers.iter() {
            let key = format!("HTTP_{}", name.to_ascii_uppercase().replace('-', "_"));
            // The first value wins, matching `Request::header`.
            ambient.server.entry(key).or_insert_with(|| value.to_owned());
        }
        ambient
            .server
            .insert("SERVER_SOFTWARE".to_owned(), self.server_software.clone());

        ambient.files = normalize_files(&request.files);
    }

    ///
    /// Drop everything the request left behind in `scope`.
    ///
    pub fn purge(&self, scope: &mut RequestScope) -> PurgeReport {
        let report = PurgeReport {
            listeners: scope.events.clear(),
            components: scope.components.clear(),
            route: scope.route.clear(),
            widgets: scope.widgets.clear(),
            ambient: !scope.ambient.is_empty(),
        };
        scope.ambient.clear();

        debug!("purged request scope: {:?}", report);

        report
    }
}

pub fn normalize_files(files: &BTreeMap<String, Upload>) -> BTreeMap<String, FileField> {
    files
        .iter()
        .map(|(field, upload)| {
            let normalized = match upload {
                Upload::Single(file) => FileField::Flat(file.clone()),
                Upload::Indexed(entries) => {
                    let mut columns = FileColumns::default();
                    for (index, file) in entries.iter() {
                        columns.push(index, file);
                    }
                    FileField::Columnar(columns)
                }
            };

            (field.clone(), normalized)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::request::UploadedFile;

    fn upload(name: &str, error: Option<i32>) -> UploadedFile {
        UploadedFile {
            name: name.to_owned(),
            mime: "image/png".to_owned(),
            tmp_name: format!("/tmp/{}", name),
            size: 42,
            error,
        }
    }

    #[test]
    fn it_should_prime_server_variables() {
        let request = Request::new("post", "/site/save?x=1")
            .with_header("User-Agent", "curl/8")
            .with_header("X-Forwarded-For", "10.0.0.1")
            .with_server("remote_addr", "127.0.0.1");
        let mut scope = RequestScope::new();

        Isolator::new("resident/test").prime(&request, &mut scope);

        let ambient = &scope.ambient;
        assert_eq!(ambient.server_var("REQUEST_METHOD"), Some("POST"));
        assert_eq!(ambient.server_var("REMOTE_ADDR"), Some("127.0.0.1"));
        assert_eq!(ambient.server_var("HTTP_USER_AGENT"), Some("curl/8"));
        assert_eq!(ambient.server_var("HTTP_X_FORWARDED_FOR"), Some("10.0.0.1"));
        assert_eq!(ambient.server_var("SERVER_SOFTWARE"), Some("resident/test"));
        assert!(ambient.get.contains_key("x"));
    }

    #[test]
    fn it_should_drop_unsigned_cookies_when_validating() {
        let validator = CookieValidator::new("secret");
        let request = Request::new("GET", "/")
            .with_cookie("lang", &validator.sign("lang", "en"))
            .with_cookie("forged", "admin");
        let mut scope = RequestScope::new();

        Isolator::new("resident/test")
            .with_validator(Some(validator))
            .prime(&request, &mut scope);

        assert_eq!(scope.ambient.cookie.get("lang").map(String::as_str), Some("en"));
        assert!(!scope.ambient.cookie.contains_key("forged"));
    }

    #[test]
    fn it_should_turn_indexed_uploads_into_columns() {
        let mut photos = BTreeMap::new();
        photos.insert("0".to_owned(), upload("a.png", None));
        photos.insert("1".to_owned(), upload("b.png", Some(4)));

        let request = Request::new("POST", "/upload")
            .with_file("avatar", Upload::Single(upload("me.png", None)))
            .with_file("photos", Upload::Indexed(photos));
        let files = normalize_files(&request.files);

        assert_eq!(
            files.get("avatar"),
            Some(&FileField::Flat(upload("me.png", None)))
        );
        match files.get("photos") {
            Some(FileField::Columnar(columns)) => {
                assert_eq!(columns.name.get("1").map(String::as_str), Some("b.png"));
                assert_eq!(columns.tmp_name.get("0").map(String::as_str), Some("/tmp/a.png"));
                assert_eq!(columns.size.len(), 2);
                assert_eq!(columns.error.len(), 1);
                assert_eq!(columns.error.get("1"), Some(&4));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn it_should_leave_a_pristine_scope_after_purge() {
        let isolator = Isolator::new("resident/test");
        let mut scope = RequestScope::new();
        isolator.prime(&Request::new("GET", "/?a=1"), &mut scope);
        scope.events.on("x", |_| {});
        scope.components.insert(5u8);
        scope.route.controller = Some("site".to_owned());
        scope.route.behaviors.push("access".to_owned());
        scope.widgets.begin("menu");

        let report = isolator.purge(&mut scope);

        assert_eq!(report.listeners, 1);
        assert_eq!(report.components, 1);
        assert!(report.route && report.widgets && report.ambient);
        assert!(scope.is_pristine());
        assert!(isolator.purge(&mut scope).is_clean());
    }
}
