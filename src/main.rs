//! FraudWatch CLI - Transaction fraud decision engine
//!
//! Screens transactions against declarative rules, shows the resulting risk
//! profiles and reports trends over a transaction log.

use std::path::Path;
use std::process;
use std::sync::Arc;

use chrono::{Duration, Utc};
use clap::{Arg, Command};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use fraudwatch::{
    config::FraudWatchConfig,
    errors::{FraudWatchError, Result},
    risk_profile::RiskProfileCalculator,
    rules::{compile, ConditionSpec, RuleAction, RuleDraft, Severity},
    storage::{DateRange, InMemoryStorage, TransactionHistory},
    transaction::{TransactionEvent, TransactionType},
    trends::{TimePeriod, TrendAnalyzer},
    utils::{self, Clock, ManualClock, RetryPolicy, SystemClock},
    AuditStatus, Evaluation, FraudWatch,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let matches = Command::new("FraudWatch")
        .version(env!("CARGO_PKG_VERSION"))
        .author("FraudWatch Team")
        .about("Rule-based transaction fraud decision engine")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .global(true)
                .help("Configuration file path (JSON)"),
        )
        .subcommand(Command::new("demo").about("Run a complete demo of rule screening, risk profiles and trends"))
        .subcommand(
            Command::new("evaluate")
                .about("Screen a file of transactions against a file of rules")
                .arg(
                    Arg::new("rules")
                        .long("rules")
                        .value_name("FILE")
                        .required(true)
                        .help("Rule drafts (JSON array)"),
                )
                .arg(
                    Arg::new("events")
                        .long("events")
                        .value_name("FILE")
                        .required(true)
                        .help("Transactions (JSON array)"),
                ),
        )
        .subcommand(
            Command::new("validate-rules")
                .about("Compile rule drafts and report any errors")
                .arg(Arg::new("file").required(true).help("Rule drafts (JSON array)")),
        )
        .subcommand(
            Command::new("trends")
                .about("Bucket a transaction log and report anomalies")
                .arg(
                    Arg::new("events")
                        .long("events")
                        .value_name("FILE")
                        .required(true)
                        .help("Transactions (JSON array)"),
                )
                .arg(
                    Arg::new("period")
                        .long("period")
                        .default_value("daily")
                        .help("daily, weekly, monthly, quarterly or yearly"),
                ),
        )
        .get_matches();

    let config = match matches.get_one::<String>("config") {
        Some(path) => match FraudWatchConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("❌ Configuration error: {}", e);
                process::exit(2);
            }
        },
        None => FraudWatchConfig::default(),
    };

    if let Err(e) = config.validate() {
        eprintln!("❌ Configuration error: {}", e);
        process::exit(2);
    }

    let outcome = match matches.subcommand() {
        Some(("demo", _)) => run_demo(config).await,
        Some(("evaluate", sub)) => match (sub.get_one::<String>("rules"), sub.get_one::<String>("events")) {
            (Some(rules), Some(events)) => evaluate_files(config, rules, events).await,
            _ => Err(FraudWatchError::validation("--rules and --events are required")),
        },
        Some(("validate-rules", sub)) => match sub.get_one::<String>("file") {
            Some(file) => validate_rules(file),
            None => Err(FraudWatchError::validation("A rule file is required")),
        },
        Some(("trends", sub)) => match sub.get_one::<String>("events") {
            Some(events) => {
                let period = sub.get_one::<String>("period").map_or("daily", String::as_str);
                show_trends(config, events, period).await
            }
            None => Err(FraudWatchError::validation("--events is required")),
        },
        _ => {
            println!("🛡️  FraudWatch - Transaction Fraud Decision Engine");
            println!("Use --help to see available commands");
            println!();
            println!("Quick Demo:");
            println!("  cargo run -- demo                                   # Run complete demonstration");
            println!("  cargo run -- validate-rules rules.json              # Check rule definitions");
            println!("  cargo run -- evaluate --rules r.json --events e.json");
            Ok(())
        }
    };

    if let Err(e) = outcome {
        eprintln!("❌ {}", e);
        process::exit(1);
    }
}

fn read_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn decision_symbol(action: RuleAction) -> &'static str {
    match action {
        RuleAction::Allow => "✅",
        RuleAction::Notify => "🔔",
        RuleAction::Review => "⚠️",
        RuleAction::Block => "🚫",
    }
}

fn print_evaluation(event: &TransactionEvent, evaluation: &Evaluation, currency: &str) {
    let decision = &evaluation.decision;
    let severity = decision.severity.map_or("-", |s| s.as_str());
    println!(
        "   {} {:<7} {:<10} {:>12} {:<10} severity: {}",
        decision_symbol(decision.action),
        decision.action.as_str(),
        event.user_id,
        utils::format_currency(event.amount, currency),
        event.transaction_type.as_str(),
        severity
    );
    if let AuditStatus::Degraded(reason) = &evaluation.audit {
        println!("      ⚠️  Audit degraded: {}", reason);
    }
    for degraded in &evaluation.degraded {
        println!("      ⚠️  Condition on {} degraded: {}", degraded.field, degraded.reason);
    }
}

fn demo_rules() -> Vec<RuleDraft> {
    vec![
        RuleDraft::new("Large transfer", Severity::High, RuleAction::Review)
            .describe("Single transaction above 1000")
            .when(ConditionSpec::new("amount", "greaterThan", json!(1000))),
        RuleDraft::new("Rapid payments", Severity::Medium, RuleAction::Notify)
            .describe("Three or more transactions within ten minutes")
            .when(ConditionSpec::new("amount", "greaterThanOrEqual", json!(3)).aggregated("count", "10m")),
        RuleDraft::new("Sanctioned destination", Severity::Critical, RuleAction::Block)
            .describe("Transfers to blocked jurisdictions")
            .when(ConditionSpec::new("type", "equals", json!("transfer")))
            .when(ConditionSpec::new("country", "in", json!(["KP", "IR"]))),
        RuleDraft::new("Daily volume", Severity::High, RuleAction::Review)
            .describe("More than 5000 moved in a day")
            .when(ConditionSpec::new("amount", "greaterThan", json!(5000)).aggregated("sum", "24h")),
    ]
}

fn demo_transactions() -> Vec<TransactionEvent> {
    let now = Utc::now();
    vec![
        TransactionEvent::new("mary", 50.0, TransactionType::Payment, now).with_category("groceries"),
        TransactionEvent::new("john", 120.0, TransactionType::Transfer, now).with_country("KE"),
        TransactionEvent::new("mary", 2500.0, TransactionType::Transfer, now).with_recipient("acct-771"),
        TransactionEvent::new("grace", 20.0, TransactionType::Payment, now),
        TransactionEvent::new("grace", 25.0, TransactionType::Payment, now),
        TransactionEvent::new("grace", 30.0, TransactionType::Payment, now),
        TransactionEvent::new("john", 400.0, TransactionType::Transfer, now).with_country("KP"),
        TransactionEvent::new("mary", 3000.0, TransactionType::Withdrawal, now),
    ]
}

async fn run_demo(config: FraudWatchConfig) -> Result<()> {
    println!("🛡️  FraudWatch Demo - Transaction Fraud Screening");
    println!("{}", "=".repeat(50));

    let storage = Arc::new(InMemoryStorage::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let currency = config.trends.currency.clone();
    let framework = FraudWatch::new(config.clone(), storage.clone(), clock.clone()).await?;

    println!("\n1. Loading fraud rules...");
    for draft in demo_rules() {
        let rule = framework.rules().create_rule(draft).await?;
        println!("   ✅ {} ({} → {})", rule.name, rule.severity, rule.action.as_str());
    }

    println!("\n2. Screening transactions...");
    let transactions = demo_transactions();
    for event in &transactions {
        let evaluation = framework.screen_transaction(event).await?;
        print_evaluation(event, &evaluation, &currency);
    }

    println!("\n3. Engine Statistics:");
    show_statistics(&framework);

    println!("\n4. Pending reviews:");
    for event in framework.reports().pending_reviews(Default::default()).await? {
        println!("   ⚠️  {} - {} ({})", event.user_id, event.rule_name, event.severity);
    }

    framework.shutdown().await;

    println!("\n5. Risk profiles:");
    let profiles = RiskProfileCalculator::new(
        storage.clone(),
        storage.clone(),
        config.risk.clone(),
        clock,
        RetryPolicy::none(),
    );
    for user in ["mary", "john", "grace"] {
        let profile = profiles.get_profile(user).await?;
        println!(
            "   👤 {:<6} score {:>5.1}  level {:?}  triggers {}",
            user, profile.score, profile.level, profile.trigger_count
        );
    }

    println!("\n6. Trend insights:");
    let now = Utc::now();
    let range = DateRange::new(now - Duration::days(1), now + Duration::days(1))?;
    let analyzer = TrendAnalyzer::new(storage, config.trends.clone());
    for insight in analyzer.get_insights(None, range, TimePeriod::Daily).await? {
        println!("   💡 {}", insight);
    }

    println!("\n✅ Demo completed successfully!");
    Ok(())
}

fn show_statistics(framework: &FraudWatch) {
    let mut stats: Vec<(String, f64)> = framework.get_statistics().into_iter().collect();
    stats.sort_by(|a, b| a.0.cmp(&b.0));

    for (key, value) in stats {
        match key.as_str() {
            "total_evaluated" => println!("   📊 Total Transactions: {:.0}", value),
            "block_rate_percent" => println!("   📊 Block Rate: {:.1}%", value),
            "review_rate_percent" => println!("   📊 Review Rate: {:.1}%", value),
            _ => println!("   📊 {}: {:.0}", key.replace('_', " "), value),
        }
    }
}

/// Replay events in timestamp order with the clock following the log
async fn evaluate_files(config: FraudWatchConfig, rules_path: &str, events_path: &str) -> Result<()> {
    let drafts: Vec<RuleDraft> = read_json(rules_path)?;
    let mut events: Vec<TransactionEvent> = read_json(events_path)?;
    events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

    let start = events.first().map_or_else(Utc::now, |e| e.timestamp) - Duration::seconds(1);
    let clock = ManualClock::new(start);
    let currency = config.trends.currency.clone();
    let framework = FraudWatch::new(config, Arc::new(InMemoryStorage::new()), clock.clone()).await?;

    println!("📋 Loading {} rules from {}", drafts.len(), rules_path);
    for draft in drafts {
        let name = draft.name.clone();
        match framework.rules().create_rule(draft).await {
            Ok(_) => println!("   ✅ {}", name),
            Err(e) => println!("   ❌ {}: {}", name, e.to_user_message()),
        }
        clock.advance(Duration::milliseconds(1));
    }

    println!("\n🔍 Screening {} transactions", events.len());
    for event in &events {
        clock.set(event.timestamp.max(clock.now()));
        match framework.screen_transaction(event).await {
            Ok(evaluation) => print_evaluation(event, &evaluation, &currency),
            Err(e) => println!("   ❌ {}: {}", event.transaction_id, e.to_user_message()),
        }
    }

    println!();
    show_statistics(&framework);
    framework.shutdown().await;
    Ok(())
}

fn validate_rules(path: &str) -> Result<()> {
    let drafts: Vec<RuleDraft> = read_json(path)?;
    let now = Utc::now();
    let mut invalid = 0;

    for draft in drafts {
        let rule = draft.into_rule(now);
        match compile(&rule) {
            Ok(compiled) => println!(
                "   ✅ {} ({} conditions, fingerprint {})",
                rule.name,
                compiled.conditions.len(),
                &compiled.fingerprint[..12]
            ),
            Err(e) => {
                invalid += 1;
                println!("   ❌ {}: {}", rule.name, e);
            }
        }
    }

    if invalid > 0 {
        return Err(FraudWatchError::validation(format!("{} invalid rule(s)", invalid)));
    }
    println!("✅ All rules valid");
    Ok(())
}

async fn show_trends(config: FraudWatchConfig, events_path: &str, period: &str) -> Result<()> {
    let period: TimePeriod = period.parse()?;
    let events: Vec<TransactionEvent> = read_json(events_path)?;

    let (Some(first), Some(last)) = (
        events.iter().map(|e| e.timestamp).min(),
        events.iter().map(|e| e.timestamp).max(),
    ) else {
        println!("No transactions in {}", events_path);
        return Ok(());
    };

    let storage = Arc::new(InMemoryStorage::new());
    for event in &events {
        storage.append_transaction(event).await?;
    }

    let range = DateRange::new(first, last + Duration::seconds(1))?;
    let currency = config.trends.currency.clone();
    let analyzer = TrendAnalyzer::new(storage, config.trends);

    println!("📈 {} trends for {} transactions", period, events.len());
    for trend in analyzer.get_trends(range, period).await? {
        let marker = if trend.anomalies.is_empty() { "  " } else { "🚨" };
        println!(
            "   {} {:<12} {:>6} txns {:>14} avg {:>12} users {:>4} recipients {:>4}",
            marker,
            trend.label,
            trend.transaction_count,
            utils::format_currency(trend.total_volume, &currency),
            utils::format_currency(trend.avg_amount, &currency),
            trend.unique_users,
            trend.unique_recipients
        );
    }

    println!("\n💡 Insights:");
    for insight in analyzer.get_insights(None, range, period).await? {
        println!("   {}", insight);
    }
    Ok(())
}
