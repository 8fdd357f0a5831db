use hmac::{Hmac, Mac};
use sha2::Sha256;

#[derive(Clone, Debug, PartialEq)]
pub struct Cookie {
    pub key: String,
    pub value: String,
    pub options: CookieOptions,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CookieOptions {
    pub domain: String,
    pub path: String,
    /// Unix timestamp in seconds, `0` for a session cookie.
    pub expires: i64,
    pub http_only: bool,
    pub max_age: u64,
    pub secure: bool,
    pub same_site: Option<SameSite>,
}

impl Default for CookieOptions {
    fn default() -> CookieOptions {
        CookieOptions {
            domain: "".to_owned(),
            path: "/".to_owned(),
            expires: 0,
            http_only: false,
            max_age: 0,
            secure: false,
            same_site: None,
        }
    }
}

impl Cookie {
    pub fn new(key: &str, value: &str, options: CookieOptions) -> Cookie {
        Cookie {
            key: key.to_owned(),
            value: value.to_owned(),
            options,
        }
    }

    ///
    /// Render this cookie as the value of a `Set-Cookie` header.
    ///
    pub fn to_header_value(&self) -> String {
        let options = &self.options;
        let mut pieces = vec![format!("Path={}", options.path)];

        if options.expires > 0 {
            if let Some(at) = chrono::DateTime::from_timestamp(options.expires, 0) {
                pieces.push(format!(
                    "Expires={}",
                    at.format("%a, %d %b %Y %H:%M:%S GMT")
                ));
            }
        }

        if options.max_age > 0 {
            pieces.push(format!("Max-Age={}", options.max_age));
        }

        if !options.domain.is_empty() {
            pieces.push(format!("Domain={}", options.domain));
        }

        if options.secure {
            pieces.push("Secure".to_owned());
        }

        if options.http_only {
            pieces.push("HttpOnly".to_owned());
        }

        if let Some(ref same_site) = options.same_site {
            match same_site {
                SameSite::Strict => pieces.push("SameSite=Strict".to_owned()),
                SameSite::Lax => pieces.push("SameSite=Lax".to_owned()),
                SameSite::None => pieces.push("SameSite=None".to_owned()),
            };
        }

        format!(
            "{}={}; {}",
            self.key,
            urlencoding::encode(&self.value),
            pieces.join("; ")
        )
    }
}

///
/// Parse the value of an inbound `Cookie` header.
///
pub fn parse_string(string: &str) -> Vec<Cookie> {
    string
        .split(';')
        .filter(|pair| !pair.trim().is_empty())
        .map(|pair| {
            let mut key_pair = pair.splitn(2, '=');

            let key = key_pair.next().unwrap_or("").trim().to_owned();
            let raw = key_pair.next().unwrap_or("").trim();
            let value = urlencoding::decode(raw)
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| raw.to_owned());

            Cookie {
                key,
                value,
                options: CookieOptions::default(),
            }
        })
        .collect()
}

type HmacSha256 = Hmac<Sha256>;

///
/// Signs outbound cookie values and validates inbound ones with
/// HMAC-SHA256 over the JSON array `[name, value]`. The signed form is
/// `hex(mac) + json`.
///
#[derive(Clone)]
pub struct CookieValidator {
    key: Vec<u8>,
}

impl CookieValidator {
    pub fn new(key: &str) -> CookieValidator {
        CookieValidator {
            key: key.as_bytes().to_vec(),
        }
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length, so this never fails.
        match HmacSha256::new_from_slice(&self.key) {
            Ok(mac) => mac,
            Err(_) => unreachable!("hmac takes keys of any size"),
        }
    }

    pub fn sign(&self, name: &str, value: &str) -> String {
        let data = serde_json::json!([name, value]).to_string();
        let mut mac = self.mac();
        mac.update(data.as_bytes());

        format!("{}{}", hex::encode(mac.finalize().into_bytes()), data)
    }

    /// Returns the original value when the signature matches `name`.
    pub fn validate(&self, name: &str, signed: &str) -> Option<String> {
        // 32 byte digest, hex encoded.
        if signed.len() < 64 || !signed.is_char_boundary(64) {
            return None;
        }
        let (digest, data) = signed.split_at(64);
        let expected = hex::decode(digest).ok()?;

        let mut mac = self.mac();
        mac.update(data.as_bytes());
        mac.verify_slice(&expected).ok()?;

        let pair: (String, String) = serde_json::from_str(data).ok()?;
        if pair.0 == name {
            Some(pair.1)
        } else {
            None
        }
    }
}
