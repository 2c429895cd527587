//! Write a batch tentatively, retract half of it, then publish the rest.

use chunkpipe::Pipe;

fn main() {
    let (mut tx, mut rx) = Pipe::<i32>::new();

    for i in 0..1024 {
        tx.write(i, true);
    }
    for _ in 0..512 {
        let value = tx.unwrite().expect("unflushed writes remain");
        println!("{value}");
    }

    tx.write(-1, false);
    tx.flush();
    while let Some(value) = rx.read() {
        println!("{value}");
    }
}
