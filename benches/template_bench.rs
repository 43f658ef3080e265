//! Quick benchmark to verify template resolution performance

use apprun::template::{parse, TEMPLATE_RESOLVER};
use serde_json::{json, Map, Value};
use std::time::Instant;

fn main() {
    let scope: Map<String, Value> = json!({
        "topic": "ownership",
        "draft": "A first draft about ownership and borrowing",
        "count": 3,
        "tags": ["rust", "memory"]
    })
    .as_object()
    .cloned()
    .unwrap_or_default();

    let templates = [
        "Simple text with no templates",
        "Write about {{topic}}",
        "{{draft}}",
        "Polish {{draft}} ({{count}} paragraphs, tags {{tags}})",
        "{{ topic }} {{missing||fallback}} {{draft}} {{count}} mixed content",
    ];

    println!("Template Resolution Performance Test");
    println!("====================================\n");

    // Warm up the cache
    for template in &templates {
        let _ = TEMPLATE_RESOLVER.resolve_str(template, &scope);
    }

    for template in &templates {
        let iterations = 100_000;
        let start = Instant::now();

        for _ in 0..iterations {
            let _ = TEMPLATE_RESOLVER.resolve_str(template, &scope);
        }

        let elapsed = start.elapsed();
        println!("Template: {:60}", format!("\"{}\"", template));
        println!("  Time for {} iterations: {:?}", iterations, elapsed);
        println!("  Per operation: {:?}\n", elapsed / iterations);
    }

    println!("Cached vs uncached parse");
    println!("========================\n");

    let template = templates[4];
    let iterations = 100_000;

    let start = Instant::now();
    for _ in 0..iterations {
        let _ = parse(template);
    }
    let uncached = start.elapsed();

    let start = Instant::now();
    for _ in 0..iterations {
        let _ = TEMPLATE_RESOLVER.tokenize(template);
    }
    let cached = start.elapsed();

    println!("  parse():    {:?} per op", uncached / iterations);
    println!("  tokenize(): {:?} per op", cached / iterations);

    // Argument maps are what the executor actually resolves per step
    let args = json!({
        "prompt": "Polish {{draft}}",
        "system": "You write about {{topic}}",
        "meta": { "tags": "{{tags}}", "n": "{{count}}" }
    });
    let args = args.as_object().cloned().unwrap_or_default();

    let start = Instant::now();
    for _ in 0..iterations {
        let _ = TEMPLATE_RESOLVER.resolve_args(&args, &scope);
    }
    println!("  resolve_args(): {:?} per op", start.elapsed() / iterations);
}
