///
/// Unwrap a `Result` inside a handler, returning `Outcome::Failure` with the
/// mapped error when the pattern matches.
///
/// ```ignore
/// let user = map_try!(find_user(id), Err(_) => Fault::not_found_error());
/// ```
///
#[macro_export]
macro_rules! map_try {
  [ $expr:expr, $pat:pat => $mapper:expr ] => ({
    match $expr {
        Ok(val) => val,
        $pat => {
            let __e = $mapper;

            return $crate::lifecycle::Outcome::Failure(Into::into(__e));
        }
    }
  });
}

///
/// The `?` of handlers: any error convertible into a `Fault` fails the
/// outcome.
///
#[macro_export]
macro_rules! outcome_try {
  ( $expr:expr ) => ({
    match $expr {
        Ok(val) => val,
        Err(e) => return $crate::lifecycle::Outcome::Failure(Into::into(e)),
    }
  });
}
