mod deployments;
