//! Human-facing pages: the PAC file, the project dashboard and the
//! terminal-styled error pages returned on the proxy's own behalf.

use std::collections::BTreeMap;

use crate::{ConfigStore, PidRegistry};

pub(crate) fn wrap_html(title: &str, content: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>{title}</title>
<style>
body {{ background: #fdf6e3; color: #657b83; font-family: sans-serif; margin: 2em auto; max-width: 50em; }}
.terminal {{ background: #002b36; color: #93a1a1; padding: 1em; border-radius: 6px; white-space: pre-wrap; font-family: monospace; }}
.terminal .error {{ color: #dc322f; }}
a.action {{ display: inline-block; margin-top: 1em; color: #268bd2; }}
table {{ border-collapse: collapse; width: 100%; }}
td, th {{ border-bottom: 1px solid #eee8d5; padding: .4em .6em; text-align: left; }}
</style>
</head>
<body>
<h1>{title}</h1>
{content}
</body>
</html>
"#
    )
}

pub(crate) fn error_terminal(text: &str) -> String {
    format!(r#"<div class="terminal"><span class="error">{text}</span></div>"#)
}

pub(crate) fn terminal(content: &str) -> String {
    format!(r#"<div class="terminal">{content}</div>"#)
}

pub(crate) fn action(href: &str, label: &str) -> String {
    format!(r#"<a class="action" href="{href}">{label}</a>"#)
}

/// The proxy auto-configuration script.
///
/// `proxy_host` is taken from the current request's `Host` header so the
/// PAC stays correct when the proxy is reached through NAT, a container or
/// a VM.
pub(crate) fn pac_file(tld: &str, proxy_host: &str) -> String {
    format!(
        r#"// Only proxy *.{tld} requests
// Configuration file in the proxy home directory (proxy.json)
function FindProxyForURL (url, host) {{
	if (dnsDomainIs(host, '.{tld}')) {{
		if (isResolvable(host)) {{
			return 'DIRECT';
		}}

		return 'PROXY {proxy_host}';
	}}

	return 'DIRECT';
}}
"#
    )
}

/// The dashboard: configured and running projects by directory.
pub(crate) fn index_page(config: &ConfigStore, registry: &dyn PidRegistry) -> String {
    let tld = config.tld();
    // Merge configured directories with the registry's running set.
    let mut projects: BTreeMap<String, (Option<u16>, Vec<String>)> = BTreeMap::new();
    for (dir, domains) in config.dirs() {
        let fqdns = domains
            .iter()
            .map(|domain| format!("{domain}.{tld}"))
            .collect();
        projects.insert(dir, (None, fqdns));
    }
    for record in registry.running_projects() {
        projects.entry(record.dir).or_default().0 = Some(record.port);
    }

    let mut content = String::from("<table><tr><th>Directory<th>Port<th>Domains");
    for (dir, (port, domains)) in projects {
        content.push_str(&format!("<tr><td>{}", shorten_home(&dir)));
        match port {
            Some(port) => content.push_str(&format!(
                r#"<td><a href="http://127.0.0.1:{port}/">{port}</a>"#
            )),
            None => content.push_str(r#"<td style="color: #b58900">Not running"#),
        }
        content.push_str("<td>");
        for domain in domains {
            if domain.contains('*') {
                content.push_str(&format!("https://{domain}/"));
            } else {
                content.push_str(&format!(
                    r#"<a href="https://{domain}/">https://{domain}/</a>"#
                ));
            }
            content.push_str("<br>");
        }
    }
    content.push_str("</table>");
    wrap_html("Proxy Index", &terminal(&content))
}

/// Shortens the user's home directory prefix to `~` for display.
fn shorten_home(dir: &str) -> String {
    if let Some(home) = dirs::home_dir()
        && let Some(rest) = dir.strip_prefix(&*home.to_string_lossy())
        && !rest.is_empty()
    {
        return format!("~{rest}");
    }
    dir.to_string()
}

pub(crate) fn not_linked_page(host_name: &str, tld: &str) -> String {
    let suffix = format!(".{tld}");
    let short = host_name
        .strip_suffix(suffix.as_str())
        .unwrap_or(host_name)
        .trim_start_matches("www.");
    wrap_html(
        "Proxy Error",
        &error_terminal(&format!(
            "# The \"{host_name}\" hostname is not linked to a directory yet.\n\
             # Link it via the following command:\n\n\
             <code>wip-proxy proxy:domain:attach {short} --dir=/some/dir</code>"
        )),
    )
}

pub(crate) fn not_started_page(host_name: &str, dir: &str) -> String {
    let content = error_terminal(&format!(
        "# It looks like the web server associated with the \"{host_name}\" hostname is not started yet.\n\
         # Start it in \"{dir}\" and retry."
    )) + &action("", "Retry");
    wrap_html("Proxy Error", &content)
}

pub(crate) fn wrong_port_page(scheme: &str, host_name: &str, port: u16) -> String {
    let (required, label) = match scheme {
        "https" => (443, "Go to port 443"),
        _ => (80, "Go to port 80"),
    };
    let content = error_terminal(&format!(
        "You must use port {required} for {} requests ({port} used)",
        scheme.to_uppercase()
    )) + &action(&format!("{scheme}://{host_name}/"), label);
    wrap_html("Proxy Error", &content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pac_file_embeds_tld_and_request_host() {
        let pac = pac_file("wip", "proxy.example:7080");
        assert!(pac.contains("dnsDomainIs(host, '.wip')"));
        assert!(pac.contains("return 'PROXY proxy.example:7080';"));
    }

    #[test]
    fn error_pages_carry_the_expected_markers() {
        assert!(not_linked_page("foo.wip", "wip").contains("not linked"));
        assert!(not_linked_page("www.foo.wip", "wip").contains("proxy:domain:attach foo "));
        assert!(not_started_page("foo.wip", "/dir").contains("not started"));
        assert!(wrong_port_page("https", "foo.wip", 8443).contains("You must use port 443"));
    }
}
