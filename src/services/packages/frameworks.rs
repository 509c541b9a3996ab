//! Framework-specific site setup steps.
//!
//! Each installer contributes numbered, user-visible steps that run inside the
//! freshly created release as the application account. New frameworks register
//! themselves in `resolve`.

pub struct SiteContext<'a> {
    pub domain: &'a str,
    /// `/home/panel/sites/<domain>`.
    pub site_root: &'a str,
    pub php_version: Option<&'a str>,
}

impl SiteContext<'_> {
    fn current(&self) -> String {
        format!("{}/current", self.site_root)
    }
}

pub struct FrameworkStep {
    pub title: &'static str,
    pub commands: Vec<String>,
}

pub trait FrameworkInstaller: Send + Sync {
    fn name(&self) -> &'static str;

    /// Path below the site root that nginx serves.
    fn public_path(&self) -> &'static str {
        "current"
    }

    fn steps(&self, site: &SiteContext<'_>) -> Vec<FrameworkStep>;
}

pub fn resolve(name: &str) -> Option<Box<dyn FrameworkInstaller>> {
    match name {
        "static" => Some(Box::new(StaticSite)),
        "php" => Some(Box::new(PlainPhp)),
        "laravel" => Some(Box::new(Laravel)),
        _ => None,
    }
}

struct StaticSite;

impl FrameworkInstaller for StaticSite {
    fn name(&self) -> &'static str {
        "static"
    }

    fn steps(&self, _site: &SiteContext<'_>) -> Vec<FrameworkStep> {
        Vec::new()
    }
}

struct PlainPhp;

impl FrameworkInstaller for PlainPhp {
    fn name(&self) -> &'static str {
        "php"
    }

    fn public_path(&self) -> &'static str {
        "current/public"
    }

    fn steps(&self, site: &SiteContext<'_>) -> Vec<FrameworkStep> {
        let current = site.current();
        vec![
            FrameworkStep {
                title: "Preparing public root",
                commands: vec![format!(
                    "cd {current} && mkdir -p public && {{ [ -f public/index.php ] || echo '<?php http_response_code(200);' > public/index.php; }}"
                )],
            },
            FrameworkStep {
                title: "Installing composer dependencies",
                commands: vec![format!(
                    "cd {current} && if [ -f composer.json ]; then composer install --no-dev --no-interaction --prefer-dist; fi"
                )],
            },
        ]
    }
}

struct Laravel;

impl FrameworkInstaller for Laravel {
    fn name(&self) -> &'static str {
        "laravel"
    }

    fn public_path(&self) -> &'static str {
        "current/public"
    }

    fn steps(&self, site: &SiteContext<'_>) -> Vec<FrameworkStep> {
        let current = site.current();
        vec![
            FrameworkStep {
                title: "Installing composer dependencies",
                commands: vec![format!(
                    "cd {current} && composer install --no-dev --no-interaction --prefer-dist"
                )],
            },
            FrameworkStep {
                title: "Preparing environment",
                commands: vec![
                    format!("cd {current} && if [ ! -f .env ] && [ -f .env.example ]; then cp .env.example .env; fi"),
                    format!("cd {current} && php artisan key:generate --force"),
                ],
            },
            FrameworkStep {
                title: "Running database migrations",
                commands: vec![format!("cd {current} && php artisan migrate --force")],
            },
            FrameworkStep {
                title: "Linking shared storage",
                commands: vec![
                    format!("cd {current} && php artisan storage:link || true"),
                    format!("chmod -R ug+rw {current}/storage {current}/bootstrap/cache"),
                ],
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context<'a>() -> SiteContext<'a> {
        SiteContext {
            domain: "app.example.com",
            site_root: "/home/panel/sites/app.example.com",
            php_version: Some("8.3"),
        }
    }

    #[test]
    fn known_frameworks_resolve_and_unknown_ones_do_not() {
        for name in ["static", "php", "laravel"] {
            assert_eq!(resolve(name).unwrap().name(), name);
        }
        assert!(resolve("rails").is_none());
    }

    #[test]
    fn laravel_migrations_run_after_the_environment_exists() {
        let steps = resolve("laravel").unwrap().steps(&context());
        let titles: Vec<&str> = steps.iter().map(|s| s.title).collect();
        let env = titles.iter().position(|t| t.contains("environment")).unwrap();
        let migrate = titles.iter().position(|t| t.contains("migrations")).unwrap();
        assert!(env < migrate);
        assert!(steps[migrate].commands[0]
            .contains("cd /home/panel/sites/app.example.com/current && php artisan migrate --force"));
    }

    #[test]
    fn static_sites_serve_the_release_root_directly() {
        let installer = resolve("static").unwrap();
        assert_eq!(installer.public_path(), "current");
        assert!(installer.steps(&context()).is_empty());
        assert_eq!(resolve("laravel").unwrap().public_path(), "current/public");
    }
}
