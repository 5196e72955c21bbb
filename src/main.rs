use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{debug, info};

use promptlib::auth::{AuthManager, AuthUser, TokenStore};
use promptlib::billing::{
    AuditLog, BillingInterval, CheckoutAction, ManageAction, ManageOutcome, SubscriptionChanger,
    SubscriptionManager, SubscriptionState, Tier, UsageTracker,
};
use promptlib::gateway::HttpGateway;
use promptlib::navigation::BrowserNavigator;
use promptlib::notify::{DesktopNotifier, LogNotifier, Notifier};
use promptlib::{admin::AdminSettings, ClientConfig, ClientContext};

#[derive(Parser)]
#[command(name = "promptlib")]
#[command(about = "Manage your prompt library subscription")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in with email and password (password from PROMPTLIB_PASSWORD if omitted)
    Login {
        email: String,
        #[arg(long)]
        password: Option<String>,
    },
    /// Forget the stored session
    Logout,
    /// Show the current plan and usage
    Status,
    /// List available plans
    Plans,
    /// Show this month's prompt usage
    Usage,
    /// Record one prompt against this month's quota
    Track,
    /// Start checkout for a plan
    Subscribe {
        plan_id: String,
        #[arg(long, default_value = "month")]
        interval: BillingInterval,
    },
    /// Move the current subscription to another plan
    Change {
        plan_id: String,
        #[arg(long, default_value = "month")]
        interval: BillingInterval,
    },
    /// Open the billing portal
    Portal,
    /// Cancel at the end of the current period
    Cancel,
    /// Undo a pending cancellation
    Reactivate,
    /// Follow subscription and usage changes live
    Watch,
    /// Show recent subscription events
    History {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Administrator settings
    Admin {
        #[command(subcommand)]
        command: AdminCommand,
    },
}

#[derive(Subcommand)]
enum AdminCommand {
    /// Check whether the signed-in user is an administrator
    Status,
    /// Print all settings
    Get,
    /// Set one or more values, e.g. `site_name="Prompt Library"`
    Set { assignments: Vec<String> },
}

struct App {
    ctx: ClientContext,
    auth: Arc<AuthManager>,
}

impl App {
    async fn new() -> Result<Self> {
        let config = ClientConfig::load().context("Failed to load configuration")?;

        let store = TokenStore::default_location()?;
        let auth = Arc::new(AuthManager::new(&config, Some(store)));
        auth.init().await.context("Failed to restore session")?;

        let notifier: Arc<dyn Notifier> = if config.desktop_notifications {
            Arc::new(DesktopNotifier::new())
        } else {
            Arc::new(LogNotifier)
        };
        let gateway = Arc::new(HttpGateway::new(&config, auth.clone()));
        let ctx = ClientContext::new(gateway, notifier, Arc::new(BrowserNavigator), config);
        Ok(Self { ctx, auth })
    }

    fn user(&self) -> Option<AuthUser> {
        self.auth.current_session().map(|session| session.user)
    }

    fn require_user(&self) -> Result<AuthUser> {
        self.user()
            .ok_or_else(|| anyhow::anyhow!("Not signed in. Run `promptlib login <email>` first."))
    }

    async fn state(&self) -> SubscriptionState {
        let user = self.user();
        SubscriptionState::mount(&self.ctx, user.as_ref().map(|u| u.id.as_str())).await
    }
}

fn print_status(state: &SubscriptionState, manager: &SubscriptionManager) {
    let tier = state.current_tier().unwrap_or(Tier::Free);
    println!("Plan:        {}", tier.display_name());
    println!(
        "Active:      {}",
        if state.is_subscription_active() { "yes" } else { "no" }
    );
    if let Some(end) = state.formatted_period_end() {
        let days = state.days_remaining().unwrap_or(0).max(0);
        println!("Period ends: {} ({} days)", end, days);
    }
    if manager.cancel_at_period_end(state) {
        println!("Renewal:     canceled at period end");
    }
}

fn print_usage(tracker: &UsageTracker) {
    match tracker.usage() {
        Some(usage) => println!(
            "Prompts:     {} / {} used ({} remaining)",
            usage.prompt_count,
            usage.monthly_limit,
            usage.remaining()
        ),
        None => println!("Prompts:     unavailable"),
    }
}

fn parse_assignment(assignment: &str) -> Result<(String, serde_json::Value)> {
    let (key, raw) = assignment
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("Expected key=value, got {}", assignment))?;
    let value = serde_json::from_str(raw)
        .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
    Ok((key.trim().to_string(), value))
}

async fn run(app: App, command: Command) -> Result<()> {
    match command {
        Command::Login { email, password } => {
            let password = match password {
                Some(password) => password,
                None => std::env::var("PROMPTLIB_PASSWORD")
                    .context("Pass --password or set PROMPTLIB_PASSWORD")?,
            };
            let session = app
                .auth
                .sign_in(&email, &password)
                .await
                .map_err(|e| anyhow::anyhow!(e.user_message()))?;
            println!(
                "Signed in as {}",
                session.user.email.as_deref().unwrap_or(&session.user.id)
            );
        }
        Command::Logout => {
            app.auth.sign_out().await?;
            println!("Signed out");
        }
        Command::Status => {
            let user = app.require_user()?;
            let state = app.state().await;
            let tracker = UsageTracker::mount(&app.ctx, Some(&user.id)).await;
            print_status(&state, &SubscriptionManager::new(&app.ctx));
            print_usage(&tracker);
        }
        Command::Plans => {
            let state = app.state().await;
            let current = state.current_tier();
            for plan in state.plans() {
                let marker = if Some(plan.tier) == current { "*" } else { " " };
                println!(
                    "{} {:<4} {:<12} ${:.2}/month  ${:.2}/year (save {}%)",
                    marker,
                    plan.id,
                    plan.name,
                    plan.price_monthly,
                    plan.price_yearly,
                    plan.yearly_discount_percent()
                );
                for feature in plan.enabled_features() {
                    println!("         - {}", feature);
                }
            }
        }
        Command::Usage => {
            let user = app.require_user()?;
            let tracker = UsageTracker::mount(&app.ctx, Some(&user.id)).await;
            print_usage(&tracker);
        }
        Command::Track => {
            let user = app.require_user()?;
            let tracker = UsageTracker::mount(&app.ctx, Some(&user.id)).await;
            if tracker.track_prompt_usage().await {
                tracker.refresh().await;
                println!("Recorded.");
                print_usage(&tracker);
            } else {
                anyhow::bail!("Prompt was not recorded");
            }
        }
        Command::Subscribe { plan_id, interval } => {
            let user = app.user();
            let state = app.state().await;
            let plan = state
                .plan(&plan_id)
                .ok_or_else(|| anyhow::anyhow!("Unknown plan {}", plan_id))?;
            let price_id = plan.price_id(interval).ok_or_else(|| {
                anyhow::anyhow!("{} is not offered with {} billing", plan.name, interval.adjective())
            })?;
            let redirect = CheckoutAction::new(&app.ctx)
                .subscribe(user.as_ref(), price_id, interval)
                .await
                .map_err(|e| anyhow::anyhow!(e.user_message()))?;
            println!("Complete checkout in your browser: {}", redirect.url);
        }
        Command::Change { plan_id, interval } => {
            app.require_user()?;
            let state = app.state().await;
            SubscriptionChanger::new(&app.ctx)
                .change_subscription(&state, &plan_id, interval)
                .await
                .map_err(|e| anyhow::anyhow!(e.user_message()))?;
            println!("Subscription updated.");
        }
        Command::Portal | Command::Cancel | Command::Reactivate => {
            app.require_user()?;
            let action = match command {
                Command::Portal => ManageAction::Portal,
                Command::Cancel => ManageAction::Cancel,
                _ => ManageAction::Reactivate,
            };
            let state = app.state().await;
            let outcome = SubscriptionManager::new(&app.ctx)
                .manage_subscription(&state, action)
                .await
                .map_err(|e| anyhow::anyhow!(e.user_message()))?;
            match outcome {
                ManageOutcome::Redirected(redirect) => {
                    println!("Billing portal opened: {}", redirect.url)
                }
                ManageOutcome::Updated {
                    cancel_at_period_end: true,
                } => println!("Your subscription will end with the current period."),
                ManageOutcome::Updated { .. } => println!("Your subscription will renew."),
            }
        }
        Command::Watch => {
            let user = app.require_user()?;
            let state = app.state().await;
            let tracker = UsageTracker::mount(&app.ctx, Some(&user.id)).await;
            let manager = SubscriptionManager::new(&app.ctx);
            let mut changes = state
                .watch_subscription()
                .ok_or_else(|| anyhow::anyhow!("No subscription to watch"))?;

            print_status(&state, &manager);
            print_usage(&tracker);
            info!("Watching for changes, press Ctrl-C to stop");
            loop {
                tokio::select! {
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if changes.borrow_and_update().is_loading {
                            continue;
                        }
                        println!("--");
                        print_status(&state, &manager);
                        print_usage(&tracker);
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            tracker.unmount().await;
            state.unmount().await;
        }
        Command::History { limit } => {
            let user = app.require_user()?;
            let audit = AuditLog::new(app.ctx.gateway.clone());
            let events = audit
                .recent_events(&user.id, limit)
                .await
                .map_err(|e| anyhow::anyhow!(e.user_message()))?;
            for event in events {
                let when = event
                    .created_at
                    .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                println!("{:<16} {:?}", when, event.event_type);
            }
            let failures = audit
                .payment_failures(&user.id)
                .await
                .map_err(|e| anyhow::anyhow!(e.user_message()))?;
            if !failures.is_empty() {
                println!("{} failed payment(s)", failures.len());
            }
        }
        Command::Admin { command } => {
            app.require_user()?;
            let admin = AdminSettings::new(&app.ctx);
            match command {
                AdminCommand::Status => {
                    let is_admin = admin
                        .is_admin()
                        .await
                        .map_err(|e| anyhow::anyhow!(e.user_message()))?;
                    println!("{}", if is_admin { "admin" } else { "not an admin" });
                }
                AdminCommand::Get => {
                    let settings = admin
                        .get()
                        .await
                        .map_err(|e| anyhow::anyhow!(e.user_message()))?;
                    println!("{}", serde_json::to_string_pretty(&settings)?);
                }
                AdminCommand::Set { assignments } => {
                    let mut settings = promptlib::admin::SettingsMap::new();
                    for assignment in &assignments {
                        let (key, value) = parse_assignment(assignment)?;
                        settings.insert(key, value);
                    }
                    admin
                        .update(settings)
                        .await
                        .map_err(|e| anyhow::anyhow!(e.user_message()))?;
                    println!("Saved.");
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("promptlib=info")),
        )
        .init();

    let cli = Cli::parse();
    debug!("Starting promptlib");
    let app = App::new().await?;
    run(app, cli.command).await
}
