mod sim;

fn parse_usize_list(arg: &str) -> Option<Vec<usize>> {
    if arg == "-" {
        return None;
    }
    let mut values = Vec::new();
    for part in arg.split(',') {
        if part.trim().is_empty() {
            return None;
        }
        let value = part.trim().parse::<usize>().ok()?;
        values.push(value);
    }
    Some(values)
}

fn parse_u32_list(arg: &str) -> Option<Vec<u32>> {
    if arg == "-" {
        return None;
    }
    let mut values = Vec::new();
    for part in arg.split(',') {
        if part.trim().is_empty() {
            return None;
        }
        let value = part.trim().parse::<u32>().ok()?;
        values.push(value);
    }
    Some(values)
}

fn print_usage(program: &str) {
    println!("conveyor CLI");
    println!("Usage:");
    println!("  {program} (run demo)");
    println!("  {program} bench [producers] [tasks_per_producer] [cost] [unit_us] [validate]");
    println!("  {program} stress [producer_sets] [task_sets] [cost_sets] [unit_us] [validate]");
    println!("  {program} --help");
    println!();
    println!("Sets are comma-separated lists (e.g., 1,2,4). Use \"-\" to keep defaults for producer/task/cost sets.");
    println!("Omit unit_us to keep its default.");
    println!("Defaults:");
    println!("  bench  producers=4 tasks_per_producer=25 cost=1 unit_us=100");
    println!("  stress producers=1,2,4,8 tasks_per_producer=10,25,50 cost=1,2,4 unit_us=100");
    println!("Flags:");
    println!("  validate  enable extra safety checks");
}

fn exit_with_usage(program: &str, message: &str) -> ! {
    eprintln!("{message}");
    print_usage(program);
    std::process::exit(2);
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_thread_names(true)
        .init();
}

fn main() {
    init_tracing();
    let program = std::env::args()
        .next()
        .unwrap_or_else(|| "conveyor".to_string());
    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("bench") => {
            let producers = args.next().and_then(|v| v.parse::<usize>().ok());
            let tasks_per_producer = args.next().and_then(|v| v.parse::<usize>().ok());
            let cost = args.next().and_then(|v| v.parse::<u32>().ok());
            let unit_us = args.next().and_then(|v| v.parse::<u64>().ok());
            let mut validate = false;
            for arg in args {
                if arg.as_str() == "validate" {
                    validate = true;
                }
            }
            sim::run_benchmark(producers, tasks_per_producer, cost, unit_us, validate);
        }
        Some("stress") => {
            let mut producer_sets: Option<Vec<usize>> = None;
            let mut task_sets: Option<Vec<usize>> = None;
            let mut cost_sets: Option<Vec<u32>> = None;
            let mut unit_us: Option<u64> = None;
            let mut producer_sets_skipped = false;
            let mut task_sets_skipped = false;
            let mut cost_sets_skipped = false;
            let mut validate = false;

            for arg in args {
                if arg.as_str() == "validate" {
                    validate = true;
                    continue;
                }

                let mut consumed = false;
                if producer_sets.is_none() && !producer_sets_skipped {
                    if arg == "-" {
                        producer_sets_skipped = true;
                        consumed = true;
                    } else if let Some(values) = parse_usize_list(&arg) {
                        producer_sets = Some(values);
                        consumed = true;
                    }
                    if !consumed {
                        exit_with_usage(
                            &program,
                            &format!("stress: invalid producer_sets value: {arg}"),
                        );
                    }
                    continue;
                }
                if task_sets.is_none() && !task_sets_skipped {
                    if arg == "-" {
                        task_sets_skipped = true;
                        consumed = true;
                    } else if let Some(values) = parse_usize_list(&arg) {
                        task_sets = Some(values);
                        consumed = true;
                    }
                    if !consumed {
                        exit_with_usage(
                            &program,
                            &format!("stress: invalid task_sets value: {arg}"),
                        );
                    }
                    continue;
                }
                if cost_sets.is_none() && !cost_sets_skipped {
                    if arg == "-" {
                        cost_sets_skipped = true;
                        consumed = true;
                    } else if let Some(values) = parse_u32_list(&arg) {
                        cost_sets = Some(values);
                        consumed = true;
                    }
                    if !consumed {
                        exit_with_usage(
                            &program,
                            &format!("stress: invalid cost_sets value: {arg}"),
                        );
                    }
                    continue;
                }
                if unit_us.is_none() {
                    if let Ok(value) = arg.parse::<u64>() {
                        unit_us = Some(value);
                    } else {
                        exit_with_usage(&program, &format!("stress: invalid unit_us value: {arg}"));
                    }
                    continue;
                }

                exit_with_usage(&program, &format!("stress: unexpected argument: {arg}"));
            }

            sim::run_stress(producer_sets, task_sets, cost_sets, unit_us, validate);
        }
        Some("--help") | Some("-h") | Some("help") => print_usage(&program),
        Some(other) => {
            exit_with_usage(&program, &format!("unknown command: {other}"));
        }
        None => sim::run_demo(),
    }
}
