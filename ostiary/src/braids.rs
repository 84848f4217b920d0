use aliri_braid::braid;
use std::fmt;

macro_rules! limited_reveal {
    ($ty:ty: $hidden:literal, $default:literal) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    f.write_str("\"")?;
                    limited_reveal(&self.0, &mut *f, $default)?;
                    f.write_str("\"")
                } else {
                    f.write_str(concat!("***", $hidden, "***"))
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    limited_reveal(&self.0, &mut *f, usize::MAX)
                } else {
                    f.write_str(concat!("***", $hidden, "***"))
                }
            }
        }
    };
}

fn limited_reveal(unprotected: &str, f: &mut fmt::Formatter, default_len: usize) -> fmt::Result {
    let max_len = f.width().unwrap_or(default_len);
    if max_len <= 1 {
        f.write_str("…")
    } else if max_len > unprotected.len() {
        f.write_str(unprotected)
    } else {
        match unprotected.char_indices().nth(max_len - 2) {
            Some((idx, c)) if idx + c.len_utf8() < unprotected.len() => {
                f.write_str(&unprotected[0..idx + c.len_utf8()])?;
                f.write_str("…")
            }
            _ => f.write_str(unprotected),
        }
    }
}

/// A bearer access token
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessToken;

limited_reveal!(AccessTokenRef: "ACCESS TOKEN", 15);

/// An identifier for the client-persisted session record
#[braid(serde, debug = "owned", display = "owned")]
pub struct SessionId;

limited_reveal!(SessionIdRef: "SESSION ID", 6);

/// An anti-forgery token bound to the persisted session
#[braid(serde, debug = "owned", display = "owned")]
pub struct CsrfToken;

limited_reveal!(CsrfTokenRef: "CSRF TOKEN", 5);

/// A derived, non-identity key used to rate-limit login attempts
#[braid(serde)]
pub struct ClientFingerprint;

/// The name a user signs in with
#[braid(serde)]
pub struct Username;

/// A user's password
#[braid(serde, debug = "owned", display = "owned")]
pub struct Password;

limited_reveal!(PasswordRef: "PASSWORD", 1);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_are_hidden_by_default() {
        let token = AccessToken::from_static("eyJhbGciOiJIUzI1NiJ9.e30.sig");
        assert_eq!(format!("{:?}", token), "***ACCESS TOKEN***");
        assert_eq!(format!("{}", token), "***ACCESS TOKEN***");
    }

    #[test]
    fn alternate_debug_reveals_a_prefix() {
        let csrf = CsrfToken::from_static("abcdefghijkl");
        assert_eq!(format!("{:#?}", csrf), "\"abcd…\"");
    }

    #[test]
    fn passwords_never_reveal_without_explicit_width() {
        let password = Password::from_static("hunter2");
        assert_eq!(format!("{:#?}", password), "\"…\"");
    }
}
