use std::collections::HashMap;
use std::env;
use std::ffi::OsString;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate, NaiveDateTime};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use pillschedule::{Config, DateRange, DoseLog, Engine, Occurrence};
use pillschedule::notify::TracingNotifier;
use pillschedule::store::{JsonFileStore, MedicationStore};


const DATE_FORMAT: &'static str = "%Y-%m-%d";
const DATE_TIME_FORMAT: &'static str = "%Y-%m-%dT%H:%M";
const TICK_INTERVAL: Duration = Duration::from_secs(60);


fn usage(program: &OsString) {
    eprintln!("Usage: {:?} [CONFIGPATH.toml] COMMAND [ARGS...]", program);
    eprintln!("Commands:");
    eprintln!("    today");
    eprintln!("    take OCCURRENCE-ID [YYYY-MM-DDTHH:MM]");
    eprintln!("    stats FROM-DATE TO-DATE");
    eprintln!("    supply MEDICATION-ID");
    eprintln!("    refill MEDICATION-ID");
    eprintln!("    watch");
}

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, DATE_FORMAT).ok()
}

fn load_config(config_path: &PathBuf) -> Option<Config> {
    let mut config_file = match File::open(config_path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("failed to open config file {:?}: {}", config_path, e);
            return None;
        },
    };
    let mut config_string = String::new();
    if let Err(e) = config_file.read_to_string(&mut config_string) {
        eprintln!("failed to read config file {:?}: {}", config_path, e);
        return None;
    };
    match toml::from_str(&config_string) {
        Ok(c) => Some(c),
        Err(e) => {
            eprintln!("failed to parse config file {:?}: {}", config_path, e);
            None
        },
    }
}

fn init_logging(log_dir: Option<&str>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "pillschedule.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    guard
}

async fn medication_names(store: &JsonFileStore, user_id: &str) -> HashMap<String, String> {
    match store.list(user_id).await {
        Ok(meds) => meds.into_iter()
            .map(|m| (m.id().to_owned(), format!("{} {}", m.name(), m.dosage())))
            .collect(),
        Err(e) => {
            error!("failed to list medications: {}", e);
            HashMap::new()
        },
    }
}

async fn cmd_today(engine: &Engine, store: &JsonFileStore, user_id: &str) -> i32 {
    let now = now();
    let names = medication_names(store, user_id).await;
    let listed = match engine.occurrences_for(DateRange::single_day(now.date()), now).await {
        Ok(l) => l,
        Err(e) => {
            error!("failed to list today's doses: {}", e);
            return 1;
        },
    };
    if listed.is_empty() {
        println!("nothing scheduled today");
    }
    for (occ, state) in listed {
        let name = names.get(occ.medication_id())
            .map(|n| n.as_str())
            .unwrap_or("?");
        println!("{}  {:<30}  {:<16}  {}", occ.scheduled().format("%H:%M"), name, state, occ);
    }
    0
}

async fn cmd_take(engine: &Engine, args: &[String]) -> i32 {
    let occurrence: Occurrence = match args.first().map(|a| a.parse()) {
        Some(Ok(o)) => o,
        Some(Err(e)) => {
            error!("{}", e);
            return 1;
        },
        None => {
            error!("missing occurrence id");
            return 1;
        },
    };
    let at = match args.get(1) {
        None => now(),
        Some(s) => match NaiveDateTime::parse_from_str(s, DATE_TIME_FORMAT) {
            Ok(t) => t,
            Err(e) => {
                error!("invalid confirmation time {:?}: {}", s, e);
                return 1;
            },
        },
    };

    match engine.confirm(&occurrence, at).await {
        Ok(ev) => {
            println!("{} taken at {} ({})", occurrence, ev.confirmed_at().format(DATE_TIME_FORMAT), ev.timing());
            0
        },
        Err(e) => {
            error!("{}", e);
            1
        },
    }
}

async fn cmd_stats(engine: &Engine, args: &[String]) -> i32 {
    let (from, to) = match (args.first().and_then(|a| parse_date(a)), args.get(1).and_then(|a| parse_date(a))) {
        (Some(f), Some(t)) => (f, t),
        _ => {
            error!("expected FROM-DATE TO-DATE as YYYY-MM-DD");
            return 1;
        },
    };
    let range = DateRange::new(from, to);
    let now = now();

    let total = match engine.adherence_stats(range, now).await {
        Ok(s) => s,
        Err(e) => {
            error!("failed to compute adherence: {}", e);
            return 1;
        },
    };
    println!(
        "adherence {:.1}%: {} of {} due taken (early {}, on time {}, late {}), {} missed, {} pending",
        total.percent(), total.taken, total.due, total.early, total.on_time, total.late, total.missed, total.pending,
    );

    if let Ok(per_med) = engine.adherence_by_medication(range, now).await {
        for (med_id, s) in per_med {
            println!("    {:<20} {:>5.1}%  ({}/{})", med_id, s.percent(), s.taken, s.due);
        }
    }
    0
}

async fn cmd_supply(engine: &Engine, args: &[String], refill: bool) -> i32 {
    let med_id = match args.first() {
        Some(m) => m,
        None => {
            error!("missing medication id");
            return 1;
        },
    };
    let res = if refill {
        engine.refill(med_id, now()).await
    } else {
        engine.supply_status(med_id).await
    };
    match res {
        Ok(status) => {
            let days = status.remaining_days
                .map(|d| format!("{} days", d))
                .unwrap_or_else(|| "no daily doses".to_owned());
            println!(
                "{}: {}/{} left ({}), signal {:?}{}",
                med_id, status.current_supply, status.total_supply, days, status.signal,
                if status.below_threshold { ", below refill threshold" } else { "" },
            );
            0
        },
        Err(e) => {
            error!("{}", e);
            1
        },
    }
}

async fn cmd_watch(engine: &Engine, notifier: &TracingNotifier) -> i32 {
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {},
            _ = tokio::signal::ctrl_c() => {
                info!("stopping");
                return 0;
            },
        }

        let now = now();
        // doses confirmed by other processes
        if let Err(e) = engine.log().refresh().await {
            error!("failed to reload dose log: {}", e);
        }
        match engine.tick(now).await {
            Ok(report) => info!("tick: {} scheduled, {} omitted", report.scheduled, report.omitted),
            Err(e) => error!("tick failed: {}", e),
        }
        for (trigger_id, payload) in notifier.take_due(now).await {
            // canceled triggers may still be in flight
            if engine.reminders().is_live(&trigger_id).await {
                println!("{}  {}", now.format("%H:%M"), payload.message());
            }
        }
    }
}


async fn perform() -> i32 {
    let args_os: Vec<OsString> = env::args_os().collect();
    let mut args: Vec<String> = args_os.iter()
        .skip(1)
        .map(|a| a.to_string_lossy().into_owned())
        .collect();
    let config_path: PathBuf = if args.first().map(|a| a.ends_with(".toml")).unwrap_or(false) {
        args.remove(0).into()
    } else {
        "config.toml".into()
    };
    if args.is_empty() {
        usage(&args_os[0]);
        return 1;
    }

    let config = match load_config(&config_path) {
        Some(c) => c,
        None => return 1,
    };

    let _log_guard = init_logging(config.log_dir.as_deref());

    let log = match DoseLog::open(&config.log_path) {
        Ok(l) => Arc::new(l),
        Err(e) => {
            error!("failed to open dose log: {}", e);
            return 1;
        },
    };
    let store = Arc::new(JsonFileStore::new(&config.data_path));
    let notifier = Arc::new(TracingNotifier::default());
    let engine = Engine::new(
        config.user_id.clone(),
        store.clone(),
        notifier.clone(),
        log,
        config.settings(),
    );

    let command = args.remove(0);
    match command.as_str() {
        "today" => cmd_today(&engine, &store, &config.user_id).await,
        "take" => cmd_take(&engine, &args).await,
        "stats" => cmd_stats(&engine, &args).await,
        "supply" => cmd_supply(&engine, &args, false).await,
        "refill" => cmd_supply(&engine, &args, true).await,
        "watch" => cmd_watch(&engine, &notifier).await,
        _other => {
            usage(&args_os[0]);
            1
        },
    }
}


#[tokio::main]
async fn main() {
    std::process::exit(perform().await)
}
