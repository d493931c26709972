//! Thin HTTP control and monitoring surface.
//!
//! | Route                        | Effect                                   |
//! |------------------------------|------------------------------------------|
//! | `POST /swarm`                | `start_ramp(locust_count, hatch_rate)`   |
//! | `GET /stop`                  | `stop()`                                 |
//! | `GET /stats/reset`           | `reset_stats()`                          |
//! | `GET /stats/requests`        | requests view as JSON                    |
//! | `GET /stats/requests/csv`    | requests view as CSV                     |
//! | `GET /stats/distribution/csv`| percentile ladder as CSV                 |
//! | `GET /exceptions`            | exception report as JSON                 |
//! | `GET /exceptions/csv`        | exception report as CSV                  |
//! | `GET /metrics`               | Prometheus exposition                    |
//!
//! The surface only calls the runner's public accessors and control
//! operations. It is unauthenticated.

use hyper::header::{HeaderValue, CONTENT_DISPOSITION, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::errors::ReportError;
use crate::metrics::{gather_metrics_string, refresh_runner_gauges};
use crate::report::{
    distribution_csv, exceptions_csv, exceptions_json, requests_csv, requests_json,
};
use crate::runner::Runner;
use crate::utils::unix_now_secs;

#[derive(Serialize)]
struct CommandResponse {
    success: bool,
    message: String,
}

fn response(status: StatusCode, content_type: &'static str, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn json_command(status: StatusCode, success: bool, message: impl Into<String>) -> Response<Body> {
    let body = serde_json::to_string(&CommandResponse {
        success,
        message: message.into(),
    })
    .unwrap_or_else(|_| "{}".to_string());
    response(status, "application/json", body)
}

fn csv_download(filename: &'static str, rendered: Result<String, ReportError>) -> Response<Body> {
    match rendered {
        Ok(body) => {
            let mut resp = response(StatusCode::OK, "text/csv", body);
            let disposition = format!("attachment; filename={}", filename);
            if let Ok(value) = HeaderValue::from_str(&disposition) {
                resp.headers_mut().insert(CONTENT_DISPOSITION, value);
            }
            resp
        }
        Err(err) => report_failure(err),
    }
}

fn json_report(rendered: Result<String, ReportError>) -> Response<Body> {
    match rendered {
        Ok(body) => response(StatusCode::OK, "application/json", body),
        Err(err) => report_failure(err),
    }
}

fn report_failure(err: ReportError) -> Response<Body> {
    error!(error = %err, "Failed to render report");
    response(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", err.to_string())
}

/// Parses `locust_count` (or `user_count`) and `hatch_rate` from an
/// `application/x-www-form-urlencoded` body.
pub fn parse_swarm_form(body: &[u8]) -> Result<(usize, f64), String> {
    let mut count = None;
    let mut rate = None;
    for (key, value) in form_urlencoded::parse(body) {
        let value = value.trim();
        match key.trim() {
            "locust_count" | "user_count" => {
                count = Some(
                    value
                        .parse::<usize>()
                        .map_err(|_| format!("invalid user count '{}'", value))?,
                );
            }
            "hatch_rate" => {
                rate = Some(
                    value
                        .parse::<f64>()
                        .map_err(|_| format!("invalid hatch rate '{}'", value))?,
                );
            }
            _ => {}
        }
    }
    match (count, rate) {
        (Some(count), Some(rate)) if rate.is_finite() && rate > 0.0 => Ok((count, rate)),
        (Some(_), Some(rate)) => Err(format!("hatch rate must be positive, got {}", rate)),
        _ => Err("locust_count and hatch_rate are required".to_string()),
    }
}

/// Routes one request against `runner`.
pub async fn handle_request(
    req: Request<Body>,
    runner: Arc<dyn Runner>,
) -> Result<Response<Body>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let resp = match (method, path.as_str()) {
        (Method::POST, "/swarm") => {
            let bytes = hyper::body::to_bytes(req.into_body()).await?;
            match parse_swarm_form(&bytes) {
                Ok((count, rate)) => {
                    runner.start_ramp(count, rate);
                    json_command(StatusCode::OK, true, "Swarming started")
                }
                Err(message) => {
                    warn!(error = %message, "Rejected swarm request");
                    json_command(StatusCode::BAD_REQUEST, false, message)
                }
            }
        }
        (Method::GET, "/stop") => {
            runner.stop();
            json_command(StatusCode::OK, true, "Test stopped")
        }
        (Method::GET, "/stats/reset") => {
            runner.reset_stats();
            response(StatusCode::OK, "text/plain", "ok")
        }
        (Method::GET, "/stats/requests") => json_report(requests_json(runner.as_ref())),
        (Method::GET, "/stats/requests/csv") => csv_download(
            "requests.csv",
            requests_csv(&runner.request_stats(), &runner.total_stats(), unix_now_secs()),
        ),
        (Method::GET, "/stats/distribution/csv") => csv_download(
            "distribution.csv",
            distribution_csv(&runner.request_stats(), &runner.total_stats()),
        ),
        (Method::GET, "/exceptions") => json_report(exceptions_json(&runner.errors())),
        (Method::GET, "/exceptions/csv") => {
            csv_download("exceptions.csv", exceptions_csv(&runner.errors()))
        }
        (Method::GET, "/metrics") => {
            refresh_runner_gauges(runner.as_ref());
            match gather_metrics_string(prometheus::default_registry()) {
                Ok(body) => response(
                    StatusCode::OK,
                    "text/plain; version=0.0.4; charset=utf-8",
                    body,
                ),
                Err(err) => {
                    error!(error = %err, "Failed to encode metrics");
                    response(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", err.to_string())
                }
            }
        }
        _ => response(StatusCode::NOT_FOUND, "text/plain", "not found"),
    };
    Ok(resp)
}

/// Serves the control surface until the task is dropped.
pub async fn start_web_server(addr: SocketAddr, runner: Arc<dyn Runner>) {
    let make_svc = make_service_fn(move |_conn| {
        let runner = runner.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let runner = runner.clone();
                async move { handle_request(req, runner).await }
            }))
        }
    });

    let server = match Server::try_bind(&addr) {
        Ok(builder) => builder.serve(make_svc),
        Err(e) => {
            error!(addr = %addr, error = %e, "Failed to bind web server");
            return;
        }
    };
    info!(addr = %addr, "Web interface started");

    if let Err(e) = server.await {
        error!(error = %e, "Web server error");
    }
}
