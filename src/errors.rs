error_chain! {
    foreign_links {
        Io(::std::io::Error);
        Toml(::toml::de::Error);
    }

    errors {
        SchedulerClosed {
            description("the scheduler worker has exited")
            display("scheduler closed")
        }

        TaskPanicked(msg: String) {
            description("a scheduled task panicked")
            display("scheduled task panicked: {}", msg)
        }

        InvalidConfig(r: String) {
            description("invalid configuration value")
            display("invalid config: {}", r)
        }
    }
}
