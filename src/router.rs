// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Request dispatch.
//!
//! `Router::dispatch` walks the routing table in registration order and
//! invokes every entry whose path matches, not just the first -- the
//! original `HTTPSession::Dispatch` does the same, which lets a later
//! handler observe or amend what an earlier one wrote to the response
//! (e.g. logging, then the real handler). A handler returning an error
//! stops the walk immediately and the response is set to 500.

use crate::error::CoreError;
use crate::parser::h1::request::H1Request;
use crate::parser::h1::response::Response;
use crate::parser::status::Status;

/// A request handler. Receives the parsed request and a response to fill
/// in; an `Err` return sets a 500 and halts dispatch.
pub type Handler = Box<dyn Fn(&H1Request<'_>, &mut Response) -> Result<(), CoreError> + Send + Sync>;

struct Route {
    path: String,
    handler: Handler,
}

/// An ordered table of `(path, handler)` entries.
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for `path`. `path` is matched literally or as a
    /// `prefix/*` glob, matching `MatchPath`'s two supported forms.
    pub fn route(&mut self, path: impl Into<String>, handler: Handler) -> &mut Self {
        self.routes.push(Route {
            path: path.into(),
            handler,
        });
        self
    }

    /// Runs every matching handler in registration order against `request`,
    /// filling in `response`. Sets 404 if nothing matched, 500 if a handler
    /// failed.
    pub fn dispatch(&self, request: &H1Request<'_>, response: &mut Response) {
        let Some(path) = request.target else {
            response.set_status_code(Status::BadRequest);
            return;
        };

        let mut matched = 0usize;
        for route in &self.routes {
            if !path_matches(&route.path, path) {
                continue;
            }
            matched += 1;
            if let Err(err) = (route.handler)(request, response) {
                log::warn!("handler for {} failed: {err}", route.path);
                response.set_status_code(Status::InternalServerError);
                return;
            }
        }

        if matched == 0 {
            response.set_status_code(Status::NotFound);
        }
    }
}

fn path_matches(pattern: &str, path: &str) -> bool {
    match pattern.strip_suffix("/*") {
        Some(prefix) => path == prefix || path.starts_with(&format!("{prefix}/")),
        None => pattern == path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_path_matches_exactly() {
        assert!(path_matches("/health", "/health"));
        assert!(!path_matches("/health", "/health/"));
    }

    #[test]
    fn glob_path_matches_prefix() {
        assert!(path_matches("/api/*", "/api/v1/weather"));
        assert!(path_matches("/api/*", "/api"));
        assert!(!path_matches("/api/*", "/apiary"));
    }

    #[test]
    fn dispatch_runs_every_matching_handler() {
        let mut router = Router::new();
        router.route(
            "/widgets/*",
            Box::new(|_req, resp| {
                resp.set_status_code(Status::Accepted);
                Ok(())
            }),
        );
        router.route(
            "/widgets/*",
            Box::new(|_req, resp| {
                resp.set_status_code(Status::Ok);
                Ok(())
            }),
        );

        let mut request = H1Request::new();
        request.target = Some("/widgets/42");
        let mut response = Response::new();
        router.dispatch(&request, &mut response);

        assert!(matches!(response.status_code(), Status::Ok));
    }

    #[test]
    fn dispatch_sets_not_found_with_no_match() {
        let router = Router::new();
        let mut request = H1Request::new();
        request.target = Some("/missing");
        let mut response = Response::new();
        router.dispatch(&request, &mut response);

        assert!(matches!(response.status_code(), Status::NotFound));
    }
}
