// crates/resilience/examples/resilience_demo.rs
//! Demonstration of resilience patterns

use holdfast_resilience::{
    new_state_map, retry_until_consistent, with_retry, CircuitBreaker, CircuitBreakerConfig,
    MapBackedStateStore, RateLimiter, RetryPolicy, Timeout,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn main() {
    env_logger::init();

    println!("Resilience Patterns Demo");
    println!("========================\n");

    demo_retry();
    println!();
    demo_circuit_breaker();
    println!();
    demo_shared_state();
    println!();
    demo_rate_limiter();
    println!();
    demo_timeout();
    println!();
    demo_stabilize();
}

fn demo_retry() {
    println!("1. Retry Pattern");
    println!("----------------");

    let attempt = Arc::new(AtomicUsize::new(0));
    let attempt_clone = Arc::clone(&attempt);

    let result = with_retry(&RetryPolicy::deadline(Duration::from_secs(1)), move || {
        let count = attempt_clone.fetch_add(1, Ordering::SeqCst) + 1;
        println!("  Attempt {}", count);

        if count < 3 {
            Err("Simulated failure")
        } else {
            Ok(42)
        }
    });

    match result {
        Ok(value) => println!("✓ Success after retries: {}", value),
        Err(e) => println!("✗ Failed: {}", e),
    }
}

fn demo_circuit_breaker() {
    println!("2. Circuit Breaker Pattern");
    println!("--------------------------");

    let config = CircuitBreakerConfig::new().with_auto_reset(Duration::from_millis(100));
    let cb = CircuitBreaker::new(config);

    for i in 1..=5 {
        let reply = cb.try_get_with(
            || {
                if i == 2 {
                    Err("Service unavailable")
                } else {
                    Ok("live reply")
                }
            },
            || println!("  Request {}: breaker tripped", i),
            || "fallback reply",
        );
        println!("  Request {}: {}", i, reply);
    }

    println!("  Circuit state: {:?}", cb.state());

    std::thread::sleep(Duration::from_millis(150));
    println!("  Waited for auto-reset...");
    println!("  Circuit state: {:?}", cb.state());

    let reply = cb.try_get(|| Ok::<_, String>("live reply"), || "fallback reply");
    println!("  After reset: {}", reply);
}

fn demo_shared_state() {
    println!("3. Shared Breaker State");
    println!("-----------------------");

    let map = new_state_map();
    let store = |prefix: &str| {
        MapBackedStateStore::new(Arc::clone(&map), prefix).map(Arc::new)
    };

    let (orders, users) = match (store("orders"), store("users")) {
        (Ok(orders), Ok(users)) => (orders, users),
        _ => {
            println!("  ✗ Could not create stores");
            return;
        }
    };

    let orders_cb = CircuitBreaker::default().with_state_store(orders);
    let users_cb = CircuitBreaker::default().with_state_store(users);

    orders_cb.try_do(|| Err("orders backend down"));
    println!("  orders: {:?}, users: {:?}", orders_cb.state(), users_cb.state());

    for entry in map.iter() {
        println!("  {} = {:?}", entry.key(), entry.value());
    }
}

fn demo_rate_limiter() {
    println!("4. Rate Limiter Pattern");
    println!("-----------------------");

    let mut limiter = match RateLimiter::builder()
        .with_rate(5, Duration::from_secs(1))
        .with_constant_throughput()
        .build()
    {
        Ok(limiter) => limiter,
        Err(e) => {
            println!("  ✗ {}", e);
            return;
        }
    };

    println!("  Minimum gap: {:?}", limiter.rate().min_gap());

    let start = Instant::now();
    for i in 1..=5 {
        limiter.invoke_when_ready(|| println!("  Request {} at {:?}", i, start.elapsed()));
    }
}

fn demo_timeout() {
    println!("5. Timeout Pattern");
    println!("------------------");

    let timeout = Timeout::new(Duration::from_millis(50));

    let result = timeout.execute(|| {
        std::thread::sleep(Duration::from_millis(10));
        42
    });

    match result {
        Ok(value) => println!("  Fast operation: ✓ Completed: {}", value),
        Err(e) => println!("  Fast operation: ✗ {}", e),
    }

    let result = timeout.execute(|| {
        std::thread::sleep(Duration::from_millis(100));
        42
    });

    match result {
        Ok(value) => println!("  Slow operation: ✓ Completed: {}", value),
        Err(e) => println!("  Slow operation: ✗ {}", e),
    }
}

fn demo_stabilize() {
    println!("6. Stabilization");
    println!("----------------");

    let start = Instant::now();
    let result = retry_until_consistent(
        Duration::from_millis(50),
        Duration::from_secs(1),
        move || {
            std::thread::sleep(Duration::from_millis(10));
            Ok::<_, String>(start.elapsed().as_millis() / 100)
        },
    );

    match result {
        Ok(value) => println!("  ✓ Settled on {} after {:?}", value, start.elapsed()),
        Err(e) => println!("  ✗ {}", e),
    }
}
