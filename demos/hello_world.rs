//! Spawns two tasks that depend on a stack value, same shape as the
//! original scope-based demo this crate's `run`/`spawn` replaced.

use asyncio::{run, spawn};

fn main() {
    let value = 22;
    let result = run(async move {
        let outer = spawn(async move {
            let inner = spawn(async move { Ok::<_, asyncio::Error>(value) });
            let v = inner.await? * 2;
            Ok::<_, asyncio::Error>(v)
        });
        let v = outer.await? * 2;
        Ok::<_, asyncio::Error>(v)
    });
    println!("{result:?}");
    println!("{value:?}");
}
