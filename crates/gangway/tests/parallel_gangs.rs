//! Integration tests exercising multi-rank gang topologies end to end:
//! the 2D mesh split on an in-process world and the full TCP bootstrap
//! driven by a synthetic launcher environment.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use gangway::{
    setup_parallel_gangs, Backend, Device, Environment, Error, Gang, GangContext,
    ProcessGroupGang, ReduceOp, SetupOptions, ThreadBackend,
};

fn run_gang_world<F>(world_size: usize, f: F)
where
    F: Fn(Arc<dyn Gang>) + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let handles: Vec<_> = ThreadBackend::create_world(world_size)
        .into_iter()
        .map(|backend| {
            let f = Arc::clone(&f);
            thread::spawn(move || {
                let backend: Arc<dyn Backend> = Arc::new(backend);
                let gang: Arc<dyn Gang> =
                    Arc::new(ProcessGroupGang::from_backend(backend, Device::Cpu));
                f(gang);
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_mesh_split_assigns_row_and_column_gangs() {
    run_gang_world(8, |root| {
        let rank = root.rank();

        let gangs = setup_parallel_gangs(&root, 2).unwrap();

        assert_eq!(gangs.tp.size(), 2);
        assert_eq!(gangs.dp.size(), 4);
        assert_eq!(gangs.tp.rank(), rank % 2);
        assert_eq!(gangs.dp.rank(), rank / 2);
    });
}

#[test]
fn test_mesh_collectives_stay_scoped_to_their_axis() {
    run_gang_world(8, |root| {
        let rank = root.rank();
        let gangs = setup_parallel_gangs(&root, 2).unwrap();

        // Rows {0,1}, {2,3}, {4,5}, {6,7}: each row sums its own ranks.
        let mut data = vec![rank as f32];
        gangs.tp.all_reduce(&mut data, ReduceOp::Sum).unwrap();
        let row_sum = (4 * (rank / 2) + 1) as f32;
        assert_eq!(data, vec![row_sum]);

        // Columns {0,2,4,6} and {1,3,5,7}: each column sums its own ranks.
        let mut data = vec![rank as f32];
        gangs.dp.all_reduce(&mut data, ReduceOp::Sum).unwrap();
        let col_sum = (4 * (rank % 2) + 12) as f32;
        assert_eq!(data, vec![col_sum]);
    });
}

#[test]
fn test_mesh_gather_orders_by_axis_rank() {
    run_gang_world(4, |root| {
        let rank = root.rank();
        let gangs = setup_parallel_gangs(&root, 2).unwrap();

        let mut output = vec![0.0; 2];
        gangs.dp.all_gather(&mut output, &[rank as f32]).unwrap();

        // Columns are {0, 2} and {1, 3}, gathered in column order.
        let expected = vec![(rank % 2) as f32, (rank % 2 + 2) as f32];
        assert_eq!(output, expected);
    });
}

#[test]
fn test_tcp_bootstrap_from_environment() {
    let handles: Vec<_> = (0..2)
        .map(|rank| {
            thread::spawn(move || {
                let env = Environment::from_vars([
                    ("WORLD_SIZE", "2".to_string()),
                    ("RANK", rank.to_string()),
                    ("MASTER_PORT", "28470".to_string()),
                    // Leave the global thread pool alone in tests.
                    ("RAYON_NUM_THREADS", "4".to_string()),
                ]);

                let context = GangContext::with_environment(env);
                let options = SetupOptions::new().timeout(Duration::from_secs(10));

                let gang = context.setup_default_gang(&options).unwrap();

                assert_eq!(gang.size(), 2);
                assert_eq!(gang.rank(), rank);

                let mut data = vec![1.0 + rank as f32];
                gang.all_reduce(&mut data, ReduceOp::Sum).unwrap();
                assert_eq!(data, vec![3.0]);

                // The gang is established once per context.
                assert!(matches!(
                    context.setup_default_gang(&options),
                    Err(Error::AlreadyInitialized)
                ));

                let again = context
                    .setup_default_gang(&options.clone().ok_initialized(true))
                    .unwrap();
                assert_eq!(again.size(), 2);

                gang.barrier().unwrap();
                gang.close().unwrap();
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_tcp_bootstrap_with_debug_group() {
    let handles: Vec<_> = (0..2)
        .map(|rank| {
            thread::spawn(move || {
                let env = Environment::from_vars([
                    ("WORLD_SIZE", "2".to_string()),
                    ("RANK", rank.to_string()),
                    ("MASTER_PORT", "28480".to_string()),
                    ("RAYON_NUM_THREADS", "4".to_string()),
                ]);

                let context = GangContext::with_environment(env);
                let options = SetupOptions::new()
                    .timeout(Duration::from_secs(10))
                    .debug(true);

                let gang = context.setup_default_gang(&options).unwrap();

                // Each collective is preceded by a monitored barrier on the
                // debug group; both must line up across ranks.
                let mut data = vec![rank as f32];
                gang.all_reduce(&mut data, ReduceOp::Max).unwrap();
                assert_eq!(data, vec![1.0]);

                gang.close().unwrap();
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}
