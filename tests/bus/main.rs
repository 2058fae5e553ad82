mod generations;
#[cfg(feature = "http")]
mod http;
mod lifecycle;
mod round_trip;
mod support;
