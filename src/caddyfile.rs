//! Renders proxy rules into Caddy configuration for a given instance port.
//!
//! Both renderings are pure: the same rules and port always produce the same
//! output, and rules keep their declared order.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::config::ProxyRule;
use crate::models::caddy::{
    Apps, Automation, AutomationPolicy, Handler, HttpApp, Issuer, MatchSet, ProxyConfigDocument,
    Route, Server, TlsApp, Upstream,
};

pub const PORT_PLACEHOLDER: &str = "{port}";

/// Name of the single HTTP server slick manages.
pub const SERVER_NAME: &str = "srv0";

#[derive(Debug, Clone)]
pub struct ProxyConfigBuilder {
    listen: Vec<String>,
}

impl ProxyConfigBuilder {
    pub fn new(listen: Vec<String>) -> Self {
        Self { listen }
    }

    /// Caddyfile text: one site block per rule, one `reverse_proxy` line per target.
    pub fn render_caddyfile(rules: &[ProxyRule], port: u16) -> String {
        let mut out = String::new();
        for rule in rules {
            out.push_str(&rule.match_expr);
            out.push_str(" {\n");
            if let Some(tls) = rule.tls.as_deref().filter(|t| !t.is_empty()) {
                let _ = writeln!(out, "  tls {tls}");
            }
            for target in &rule.reverse_proxy {
                let to = substitute_port(&target.to, port);
                if target.path.is_empty() {
                    let _ = writeln!(out, "  reverse_proxy {to}");
                } else {
                    let _ = writeln!(out, "  reverse_proxy {} {to}", target.path);
                }
            }
            out.push_str("}\n");
        }
        out
    }

    /// Complete Caddy JSON document pointing every rule at `port`.
    pub fn build(&self, rules: &[ProxyRule], port: u16) -> ProxyConfigDocument {
        let mut routes = Vec::with_capacity(rules.len());
        let mut policies = Vec::new();

        for rule in rules {
            let hosts = site_hosts(&rule.match_expr);

            let inner = rule
                .reverse_proxy
                .iter()
                .map(|target| Route {
                    matchers: if target.path.is_empty() {
                        Vec::new()
                    } else {
                        vec![MatchSet {
                            path: vec![target.path.clone()],
                            ..Default::default()
                        }]
                    },
                    handle: vec![Handler::ReverseProxy {
                        upstreams: vec![Upstream {
                            dial: dial_address(&substitute_port(&target.to, port)),
                        }],
                    }],
                    terminal: false,
                })
                .collect();

            routes.push(Route {
                matchers: if hosts.is_empty() {
                    Vec::new()
                } else {
                    vec![MatchSet {
                        host: hosts.clone(),
                        ..Default::default()
                    }]
                },
                handle: vec![Handler::Subroute { routes: inner }],
                terminal: true,
            });

            if let Some(tls) = rule.tls.as_deref().filter(|t| !t.is_empty())
                && !hosts.is_empty()
            {
                policies.push(AutomationPolicy {
                    subjects: hosts,
                    issuers: vec![tls_issuer(tls)],
                });
            }
        }

        let servers = BTreeMap::from([(
            SERVER_NAME.to_string(),
            Server {
                listen: self.listen.clone(),
                routes,
            },
        )]);

        ProxyConfigDocument {
            apps: Apps {
                http: HttpApp { servers },
                tls: (!policies.is_empty()).then(|| TlsApp {
                    automation: Automation { policies },
                }),
            },
        }
    }
}

pub fn substitute_port(template: &str, port: u16) -> String {
    template.replace(PORT_PLACEHOLDER, &port.to_string())
}

fn tls_issuer(directive: &str) -> Issuer {
    match directive.trim() {
        "internal" => Issuer::Internal,
        email => Issuer::Acme {
            email: Some(email.to_string()),
        },
    }
}

/// Host names addressed by a site expression such as `https://a.com, b.com:8443`.
fn site_hosts(expr: &str) -> Vec<String> {
    expr.split(|c: char| c == ',' || c.is_whitespace())
        .map(|addr| {
            addr.trim_start_matches("https://")
                .trim_start_matches("http://")
        })
        .map(|addr| addr.split_once('/').map_or(addr, |(host, _)| host))
        .map(|addr| {
            if addr.ends_with(']') {
                addr
            } else {
                addr.rsplit_once(':').map_or(addr, |(host, _)| host)
            }
        })
        .filter(|host| !host.is_empty())
        .map(str::to_string)
        .collect()
}

/// Upstream dial strings are bare `host:port`.
fn dial_address(to: &str) -> String {
    let to = to
        .trim_start_matches("http://")
        .trim_start_matches("https://");
    to.split_once('/').map_or(to, |(addr, _)| addr).to_string()
}
