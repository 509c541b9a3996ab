//! Sites: release directory layout, framework setup and the nginx vhost.

use std::time::Duration;

use serde::Deserialize;

use crate::services::orchestrator::milestones::{Milestone, MilestoneLedger};
use crate::services::orchestrator::store;
use crate::services::orchestrator::types::{
    ActionError, ActionKind, CredentialRole, EntityKind, EntityRow, PackageAction, ServerRow, Step,
};

use super::frameworks::{self, SiteContext};
use super::{
    as_application, parse_config, php, require_active_entity, write_file_command, RecipeDeps,
};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SiteConfig {
    pub domain: String,
    pub framework: String,
    #[serde(default)]
    pub php_version: Option<String>,
    #[serde(default)]
    pub repo_url: Option<String>,
}

pub const INSTALL_LEDGER: MilestoneLedger = MilestoneLedger::new(
    "site_install",
    &[
        Milestone {
            id: "validated",
            label: "Checking web stack",
        },
        Milestone {
            id: "directories",
            label: "Creating site directories",
        },
        Milestone {
            id: "framework",
            label: "Running framework setup",
        },
        Milestone {
            id: "published",
            label: "Publishing virtual host",
        },
    ],
);

pub const REMOVE_LEDGER: MilestoneLedger = MilestoneLedger::new(
    "site_remove",
    &[
        Milestone {
            id: "unpublished",
            label: "Retiring virtual host",
        },
        Milestone {
            id: "purged",
            label: "Removing site files",
        },
    ],
);

pub fn site_root(domain: &str) -> String {
    format!("/home/panel/sites/{domain}")
}

pub async fn install(
    deps: &RecipeDeps,
    server: &ServerRow,
    entity: &EntityRow,
) -> Result<PackageAction, ActionError> {
    let config: SiteConfig = parse_config(entity)?;
    validate_domain(&config.domain)?;
    let installer = frameworks::resolve(&config.framework).ok_or_else(|| {
        ActionError::InvalidConfiguration(format!(
            "framework {:?} is not supported",
            config.framework
        ))
    })?;
    let needs_php = installer.public_path() != "current";
    if needs_php && config.php_version.is_none() {
        return Err(ActionError::InvalidConfiguration(format!(
            "framework {:?} requires php_version in the site configuration",
            config.framework
        )));
    }
    if let Some(version) = &config.php_version {
        php::validate_version(version)?;
    }
    if let Some(repo) = &config.repo_url {
        validate_repo_url(repo)?;
    }
    require_active_entity(&deps.db, server.id, EntityKind::Nginx, "web server").await?;
    if needs_php {
        require_active_entity(&deps.db, server.id, EntityKind::Php, "PHP runtime").await?;
    }

    let domain = config.domain.clone();
    let root = site_root(&domain);
    let initial = format!("{root}/releases/initial");
    let context = SiteContext {
        domain: &domain,
        site_root: &root,
        php_version: config.php_version.as_deref(),
    };
    let framework_steps = installer.steps(&context);

    let mut steps = vec![
        Step::Command("nginx -t".to_string()),
        Step::Track("validated"),
        Step::Command(format!(
            "install -d -o panel -g panel {root} {root}/releases {root}/shared {initial}"
        )),
    ];
    match &config.repo_url {
        Some(repo) => steps.push(Step::Command(as_application(&format!(
            "git clone --depth 1 {repo} {initial}"
        )))),
        None => steps.push(Step::Command(as_application(&format!(
            "echo '<h1>{domain}</h1>' > {initial}/index.html"
        )))),
    }
    steps.push(Step::Command(as_application(&format!(
        "ln -sfn {initial} {root}/current"
    ))));
    steps.push(Step::Track("directories"));

    if !framework_steps.is_empty() {
        let total = framework_steps.len() as u32;
        steps.push(seed_step_records(deps, entity.id, total));
    }
    for (index, framework_step) in framework_steps.into_iter().enumerate() {
        let number = index as u32 + 1;
        steps.push(record_step_status(deps, entity.id, number, "installing"));
        for command in framework_step.commands {
            steps.push(Step::Command(as_application(&command)));
        }
        steps.push(record_step_status(deps, entity.id, number, "done"));
    }
    steps.push(Step::Track("framework"));

    let vhost = render_vhost(&domain, installer.public_path(), config.php_version.as_deref());
    steps.push(Step::Command(write_file_command(
        &format!("/etc/nginx/sites-available/{domain}.conf"),
        &vhost,
    )));
    steps.push(Step::Command(format!(
        "ln -sfn /etc/nginx/sites-available/{domain}.conf /etc/nginx/sites-enabled/{domain}.conf"
    )));
    steps.push(Step::Command("nginx -t".to_string()));
    steps.push(Step::Command("systemctl reload nginx".to_string()));
    steps.push(Step::Track("published"));

    Ok(PackageAction {
        kind: ActionKind::Install,
        role: CredentialRole::Root,
        ledger: INSTALL_LEDGER,
        steps,
        command_timeout: Duration::ZERO,
    })
}

pub fn remove(entity: &EntityRow) -> Result<PackageAction, ActionError> {
    let config: SiteConfig = parse_config(entity)?;
    validate_domain(&config.domain)?;
    let domain = &config.domain;
    let root = site_root(domain);
    let steps = vec![
        Step::Command(format!(
            "rm -f /etc/nginx/sites-enabled/{domain}.conf /etc/nginx/sites-available/{domain}.conf"
        )),
        // nginx may already be gone when the whole server is being torn down.
        Step::Command("nginx -t && systemctl reload nginx || true".to_string()),
        Step::Track("unpublished"),
        Step::Command(format!("rm -rf {root}")),
        Step::Track("purged"),
    ];
    Ok(PackageAction {
        kind: ActionKind::Remove,
        role: CredentialRole::Root,
        ledger: REMOVE_LEDGER,
        steps,
        command_timeout: Duration::ZERO,
    })
}

fn seed_step_records(deps: &RecipeDeps, site_id: uuid::Uuid, total: u32) -> Step {
    let db = deps.db.clone();
    let handle = deps.handle.clone();
    Step::effect(move || {
        for number in 1..=total {
            handle
                .block_on(store::set_site_install_step(&db, site_id, number, "pending"))
                .map_err(|err| anyhow::anyhow!("failed to seed site step records: {err}"))?;
        }
        Ok(())
    })
}

fn record_step_status(
    deps: &RecipeDeps,
    site_id: uuid::Uuid,
    number: u32,
    status: &'static str,
) -> Step {
    let db = deps.db.clone();
    let handle = deps.handle.clone();
    Step::effect(move || {
        handle
            .block_on(store::set_site_install_step(&db, site_id, number, status))
            .map_err(|err| anyhow::anyhow!("failed to record site step status: {err}"))?;
        Ok(())
    })
}

fn render_vhost(domain: &str, public_path: &str, php_version: Option<&str>) -> String {
    let root = format!("{}/{public_path}", site_root(domain));
    let mut body = format!(
        "server {{\n    listen 80;\n    listen [::]:80;\n    server_name {domain};\n    root {root};\n"
    );
    body.push_str(&format!(
        "    access_log /var/log/nginx/{domain}.access.log;\n    error_log /var/log/nginx/{domain}.error.log;\n"
    ));
    match php_version {
        Some(version) => {
            body.push_str("    index index.php index.html;\n");
            body.push_str(
                "    location / {\n        try_files $uri $uri/ /index.php?$query_string;\n    }\n",
            );
            body.push_str(&format!(
                "    location ~ \\.php$ {{\n        include snippets/fastcgi-php.conf;\n        fastcgi_pass unix:/run/php/php{version}-fpm.sock;\n    }}\n"
            ));
        }
        None => {
            body.push_str("    index index.html index.htm;\n");
            body.push_str("    location / {\n        try_files $uri $uri/ =404;\n    }\n");
        }
    }
    body.push_str("    location ~ /\\.(?!well-known) {\n        deny all;\n    }\n}\n");
    body
}

/// Domains end up in filesystem paths and nginx directives, so only safe
/// hostname characters pass.
pub(crate) fn validate_domain(domain: &str) -> Result<(), ActionError> {
    let ok = !domain.is_empty()
        && domain.len() <= 253
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !domain.contains("..")
        && domain
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-');
    if !ok {
        return Err(ActionError::InvalidConfiguration(format!(
            "domain {domain:?} is not a valid hostname"
        )));
    }
    Ok(())
}

fn validate_repo_url(repo: &str) -> Result<(), ActionError> {
    let scheme_ok = repo.starts_with("https://") || repo.starts_with("git@");
    let chars_ok = repo
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '@' | ':' | '/' | '.' | '_' | '-' | '~'));
    if !scheme_ok || !chars_ok {
        return Err(ActionError::InvalidConfiguration(format!(
            "repository url {repo:?} must be https or git-over-ssh"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{action_commands, entity_row, recipe_deps, server_row, tracked_count};

    fn site_entity(config: serde_json::Value) -> EntityRow {
        entity_row(EntityKind::Site, "app", config)
    }

    #[test]
    fn domain_validation_guards_paths() {
        assert!(validate_domain("app.example.com").is_ok());
        assert!(validate_domain("app..example.com").is_err());
        assert!(validate_domain("../etc").is_err());
        assert!(validate_domain("App.Example.com").is_err());
        assert!(validate_domain("a.example.com/../..").is_err());
    }

    #[test]
    fn repo_urls_are_restricted_to_git_transports() {
        assert!(validate_repo_url("https://github.com/acme/app.git").is_ok());
        assert!(validate_repo_url("git@github.com:acme/app.git").is_ok());
        assert!(validate_repo_url("https://github.com/acme/app.git; rm -rf /").is_err());
        assert!(validate_repo_url("file:///etc/passwd").is_err());
    }

    #[test]
    fn php_vhosts_route_through_fpm_and_static_ones_do_not() {
        let vhost = render_vhost("app.example.com", "current/public", Some("8.3"));
        assert!(vhost.contains("root /home/panel/sites/app.example.com/current/public;"));
        assert!(vhost.contains("fastcgi_pass unix:/run/php/php8.3-fpm.sock;"));

        let plain = render_vhost("app.example.com", "current", None);
        assert!(plain.contains("try_files $uri $uri/ =404;"));
        assert!(!plain.contains("fastcgi_pass"));
    }

    #[tokio::test]
    async fn php_frameworks_must_name_a_php_version() {
        let entity = site_entity(serde_json::json!({
            "domain": "app.example.com",
            "framework": "laravel",
        }));
        let deps = recipe_deps();
        let server = server_row();
        let err = install(&deps, &server, &entity).await.unwrap_err();
        assert!(matches!(err, ActionError::InvalidConfiguration(_)));
    }

    #[test]
    fn removal_retires_the_vhost_before_deleting_files() {
        let entity = site_entity(serde_json::json!({
            "domain": "app.example.com",
            "framework": "static",
        }));
        let action = remove(&entity).unwrap();
        let commands = action_commands(&action);
        let unpublish = commands
            .iter()
            .position(|c| c.contains("rm -f /etc/nginx/sites-enabled/app.example.com.conf"))
            .unwrap();
        let purge = commands
            .iter()
            .position(|c| c == "rm -rf /home/panel/sites/app.example.com")
            .unwrap();
        assert!(unpublish < purge);
        assert_eq!(tracked_count(&action), REMOVE_LEDGER.total());
    }
}
