use procura_core::config::{AppConfig, LoadOptions};
use procura_db::connect_with_settings;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Warn,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> String {
    let report = build_report();

    if json_output {
        return serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
    }

    render_human(&report)
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_database_connectivity(&config));
            checks.push(check_extraction_key(&config));
            checks.push(check_binary("wkhtmltopdf_available", "wkhtmltopdf"));
            checks.push(check_binary("pdftotext_available", "pdftotext"));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            for name in ["database_connectivity", "extraction_api_key"] {
                checks.push(DoctorCheck {
                    name,
                    status: CheckStatus::Skipped,
                    details: "skipped because configuration did not load".to_string(),
                });
            }
        }
    }

    let any_fail = checks.iter().any(|check| check.status == CheckStatus::Fail);
    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if any_fail {
        CheckStatus::Fail
    } else if all_pass {
        CheckStatus::Pass
    } else {
        CheckStatus::Warn
    };
    let summary = match overall_status {
        CheckStatus::Pass => "doctor: all readiness checks passed".to_string(),
        CheckStatus::Warn => {
            "doctor: service is functional; document tooling is degraded".to_string()
        }
        _ => "doctor: one or more readiness checks failed".to_string(),
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_database_connectivity(config: &AppConfig) -> DoctorCheck {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Fail,
                details: format!("failed to initialize async runtime: {error}"),
            };
        }
    };

    let outcome = runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await?;
        sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(&pool).await?;
        pool.close().await;
        Ok::<(), sqlx::Error>(())
    });

    match outcome {
        Ok(()) => DoctorCheck {
            name: "database_connectivity",
            status: CheckStatus::Pass,
            details: format!("connected to {}", config.database.url),
        },
        Err(error) => DoctorCheck {
            name: "database_connectivity",
            status: CheckStatus::Fail,
            details: error.to_string(),
        },
    }
}

fn check_extraction_key(config: &AppConfig) -> DoctorCheck {
    if config.extraction.api_key.is_some() {
        DoctorCheck {
            name: "extraction_api_key",
            status: CheckStatus::Pass,
            details: "extraction api key configured".to_string(),
        }
    } else {
        DoctorCheck {
            name: "extraction_api_key",
            status: CheckStatus::Warn,
            details: "no api key; proforma and receipt metadata will be degraded".to_string(),
        }
    }
}

fn check_binary(name: &'static str, binary: &str) -> DoctorCheck {
    match which::which(binary) {
        Ok(path) => DoctorCheck {
            name,
            status: CheckStatus::Pass,
            details: format!("found at {}", path.to_string_lossy()),
        },
        Err(_) => DoctorCheck {
            name,
            status: CheckStatus::Warn,
            details: format!("{binary} not found in PATH; falling back to degraded output"),
        },
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = vec![report.summary.clone()];
    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Warn => "warn",
            CheckStatus::Fail => "FAIL",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("  [{marker}] {}: {}", check.name, check.details));
    }
    lines.join("\n")
}

fn escape_json(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::{build_report, render_human};

    #[test]
    fn report_renders_one_line_per_check() {
        let report = build_report();
        let human = render_human(&report);

        assert!(human.lines().count() > report.checks.len());
        for check in &report.checks {
            assert!(human.contains(check.name));
        }
    }

    #[test]
    fn json_output_is_parseable() {
        let output = super::run(true);
        let parsed: serde_json::Value = serde_json::from_str(&output).expect("valid json");
        assert!(parsed.get("overall_status").is_some());
        assert!(parsed.get("checks").is_some());
    }
}
